use std::{borrow::Cow, collections::BTreeMap, io::Cursor, sync::Arc};

use anyhow::Result;

use mcap_rs::{
    records::{self, op},
    Channel, Compression, LexerOptions, Message, MessageIter, ReadOptions, RecordIterator, Schema,
    Summary, WriteOptions,
};

fn test_messages() -> Vec<Message<'static>> {
    let schema = Arc::new(Schema {
        id: 1,
        name: "s".into(),
        encoding: "e".into(),
        data: Cow::Owned(vec![]),
    });
    let channel = Arc::new(Channel {
        id: 1,
        topic: "/t".into(),
        schema: Some(schema),
        message_encoding: "r".into(),
        metadata: BTreeMap::new(),
    });
    vec![
        Message {
            channel: channel.clone(),
            sequence: 0,
            log_time: 100,
            publish_time: 100,
            data: Cow::Owned(vec![1, 2, 3, 4]),
        },
        Message {
            channel,
            sequence: 1,
            log_time: 200,
            publish_time: 200,
            data: Cow::Owned(vec![5, 6, 7, 8]),
        },
    ]
}

fn write_messages(opts: WriteOptions, messages: &[Message<'static>]) -> Result<Vec<u8>> {
    let mut writer = opts.create(Cursor::new(Vec::new()))?;
    for message in messages {
        writer.write(message)?;
    }
    Ok(writer.into_inner()?.into_inner())
}

#[test]
fn unchunked_round_trip() -> Result<()> {
    let expected = test_messages();
    let mcap = write_messages(
        WriteOptions::new().use_chunks(false).profile("ros1"),
        &expected,
    )?;

    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("file should have a summary");
    let stats = summary.stats.as_ref().expect("stats should be written");
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.channel_count, 1);
    assert_eq!(stats.schema_count, 1);
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(stats.message_start_time, 100);
    assert_eq!(stats.message_end_time, 200);

    let ours: Vec<Message> = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?
        .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(ours, expected);
    Ok(())
}

#[test]
fn chunked_round_trip() -> Result<()> {
    let expected = test_messages();
    for compression in [
        None,
        Some(Compression::Zstd),
        Some(Compression::Lz4),
    ] {
        let mcap = write_messages(
            WriteOptions::new().compression(compression).include_crc(true),
            &expected,
        )?;
        let ours: Vec<Message> = MessageIter::new(
            Cursor::new(&mcap),
            ReadOptions::new().validate_chunk_crcs(true),
        )?
        .collect::<mcap_rs::McapResult<_>>()?;
        assert_eq!(ours, expected, "compression: {compression:?}");
    }
    Ok(())
}

#[test]
fn header_carries_profile_and_library() -> Result<()> {
    fn read_header(mcap: &[u8]) -> records::Header {
        let headers: Vec<records::Header> = RecordIterator::new(mcap)
            .filter_map(|record| match record.unwrap() {
                records::Record::Header(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(headers.len(), 1);
        headers.into_iter().next().unwrap()
    }

    let mcap = write_messages(WriteOptions::new().profile("ros1"), &test_messages())?;
    let header = read_header(&mcap);
    assert_eq!(header.profile, "ros1");
    assert_eq!(
        header.library,
        format!("mcap-rs {}", env!("CARGO_PKG_VERSION"))
    );

    let appended = write_messages(WriteOptions::new().library("my recorder"), &test_messages())?;
    assert_eq!(
        read_header(&appended).library,
        format!("mcap-rs {}; my recorder", env!("CARGO_PKG_VERSION"))
    );

    let overridden = write_messages(
        WriteOptions::new().library("my recorder").override_library(true),
        &test_messages(),
    )?;
    assert_eq!(read_header(&overridden).library, "my recorder");
    Ok(())
}

#[test]
fn summary_offsets_cover_each_group() -> Result<()> {
    let mcap = write_messages(WriteOptions::new(), &test_messages())?;
    let footer = mcap_rs::read_footer(&mut Cursor::new(&mcap))?;
    assert_ne!(footer.summary_start, 0);
    assert_ne!(footer.summary_offset_start, 0);

    const FOOTER_RECORD_LEN: usize = 1 + 8 + 20;
    let offsets_end = mcap.len() - FOOTER_RECORD_LEN - 8;
    let offsets: Vec<records::SummaryOffset> = RecordIterator::new_with_options(
        &mcap[footer.summary_offset_start as usize..offsets_end],
        LexerOptions::default().with_skip_start_magic(true),
    )
    .map(|record| match record.unwrap() {
        records::Record::SummaryOffset(so) => so,
        wut => panic!("expected summary offset, got {wut:?}"),
    })
    .collect();

    // Groups appear in the fixed summary order.
    let group_opcodes: Vec<u8> = offsets.iter().map(|o| o.group_opcode).collect();
    assert_eq!(
        group_opcodes,
        &[op::SCHEMA, op::CHANNEL, op::STATISTICS, op::CHUNK_INDEX]
    );

    // Each group's byte range holds records of exactly its opcode.
    for offset in offsets {
        let group_start = offset.group_start as usize;
        let group_end = (offset.group_start + offset.group_length) as usize;
        for record in RecordIterator::new_with_options(
            &mcap[group_start..group_end],
            LexerOptions::default()
                .with_skip_start_magic(true)
                .with_emit_chunks(true),
        ) {
            assert_eq!(offset.group_opcode, record.unwrap().opcode());
        }
    }
    Ok(())
}

#[test]
fn output_is_deterministic() -> Result<()> {
    let make = || -> Result<Vec<u8>> {
        let mut writer = WriteOptions::new()
            .compression(Some(Compression::Zstd))
            .include_crc(true)
            .create(Cursor::new(Vec::new()))?;
        let mut metadata = BTreeMap::new();
        // Insertion order differs from key order; serialization must not care.
        metadata.insert("zebra".to_string(), "1".to_string());
        metadata.insert("aardvark".to_string(), "2".to_string());
        let channel_id = writer.add_channel(0, "/t", "json", &metadata)?;
        for sequence in 0..1000u32 {
            writer.write_message(
                &records::MessageHeader {
                    channel_id,
                    sequence,
                    log_time: sequence as u64,
                    publish_time: sequence as u64,
                },
                &sequence.to_le_bytes(),
            )?;
        }
        writer.write_metadata(&records::Metadata {
            name: "meta".into(),
            metadata,
        })?;
        Ok(writer.into_inner()?.into_inner())
    };

    let first = make()?;
    let second = make()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn empty_file_is_eof() -> Result<()> {
    let mut mcap = Vec::new();
    mcap.extend_from_slice(mcap_rs::MAGIC);
    mcap.extend_from_slice(mcap_rs::MAGIC);
    let mut messages = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?;
    assert!(messages.next().is_none());
    Ok(())
}
