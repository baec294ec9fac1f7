use std::{collections::BTreeMap, io::Cursor};

use anyhow::Result;

use mcap_rs::{
    records::MessageHeader, Compression, McapError, MessageIter, ReadOptions, Summary,
    WriteOptions,
};

fn write_two_chunk_file() -> Result<Vec<u8>> {
    let mut writer = WriteOptions::new()
        .compression(Some(Compression::Zstd))
        .include_crc(true)
        .create(Cursor::new(Vec::new()))?;
    let channel = writer.add_channel(0, "/t", "json", &BTreeMap::new())?;
    for log_time in 0..10u64 {
        writer.write_message(
            &MessageHeader {
                channel_id: channel,
                sequence: log_time as u32,
                log_time,
                publish_time: log_time,
            },
            b"payload payload payload",
        )?;
        if log_time == 4 {
            writer.flush()?;
        }
    }
    Ok(writer.into_inner()?.into_inner())
}

#[test]
fn valid_crcs_pass() -> Result<()> {
    let mcap = write_two_chunk_file()?;
    let messages: Vec<_> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new().validate_chunk_crcs(true),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 10);
    Ok(())
}

#[test]
fn tampering_with_a_chunk_fails_its_crc() -> Result<()> {
    let mut mcap = write_two_chunk_file()?;
    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("indexed file");
    assert_eq!(summary.chunk_indexes.len(), 2);

    // Corrupt one byte inside the second chunk record.
    let target = summary.chunk_indexes[1].chunk_start_offset as usize + 35;
    mcap[target] ^= 0xff;

    let mut reader = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new().validate_chunk_crcs(true),
    )?;
    // The first chunk still reads back intact.
    for expected in 0..5u64 {
        let message = reader.next().expect("first chunk is intact")?;
        assert_eq!(message.log_time, expected);
    }
    // Entering the second chunk trips its CRC.
    assert!(matches!(
        reader.next(),
        Some(Err(McapError::BadChunkCrc { .. }))
    ));
    assert!(reader.next().is_none());
    Ok(())
}

#[test]
fn tampering_is_invisible_without_validation() -> Result<()> {
    let mut mcap = write_two_chunk_file()?;
    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("indexed file");

    // Flip a bit in the second chunk's stored CRC field (body offset 24..28).
    let target = summary.chunk_indexes[1].chunk_start_offset as usize + 9 + 24;
    mcap[target] ^= 0x01;

    let messages: Vec<_> = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?
        .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 10);
    Ok(())
}

#[test]
fn data_end_carries_data_section_crc() -> Result<()> {
    let mcap = write_two_chunk_file()?;
    let with_crc = mcap_rs::RecordIterator::new(&mcap[..])
        .find_map(|record| match record.unwrap() {
            mcap_rs::records::Record::DataEnd(e) => Some(e),
            _ => None,
        })
        .expect("file has a data end");
    assert_ne!(with_crc.data_section_crc, 0);

    // CRCs off: every CRC field is zero.
    let mut writer = WriteOptions::new()
        .compression(None)
        .create(Cursor::new(Vec::new()))?;
    let channel = writer.add_channel(0, "/t", "json", &BTreeMap::new())?;
    writer.write_message(
        &MessageHeader {
            channel_id: channel,
            sequence: 0,
            log_time: 0,
            publish_time: 0,
        },
        &[1],
    )?;
    let plain = writer.into_inner()?.into_inner();
    for record in mcap_rs::RecordIterator::new_with_options(
        &plain[..],
        mcap_rs::LexerOptions::default().with_emit_chunks(true),
    ) {
        match record? {
            mcap_rs::records::Record::DataEnd(e) => assert_eq!(e.data_section_crc, 0),
            mcap_rs::records::Record::Chunk { header, .. } => {
                assert_eq!(header.uncompressed_crc, 0)
            }
            mcap_rs::records::Record::Footer(f) => assert_eq!(f.summary_crc, 0),
            _ => {}
        }
    }
    Ok(())
}
