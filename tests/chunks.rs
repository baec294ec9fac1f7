use std::{collections::BTreeMap, io::Cursor};

use anyhow::Result;
use itertools::Itertools;

use mcap_rs::{
    records::MessageHeader, Compression, MessageIter, ReadOptions, Summary, WriteOptions,
};

/// Writes 1000 messages alternating between two channels, with log times
/// 0..999.
fn write_two_channel_file(opts: WriteOptions) -> Result<Vec<u8>> {
    let mut writer = opts.create(Cursor::new(Vec::new()))?;
    let even = writer.add_channel(0, "even", "json", &BTreeMap::new())?;
    let odd = writer.add_channel(0, "odd", "json", &BTreeMap::new())?;
    for i in 0..1000u64 {
        writer.write_message(
            &MessageHeader {
                channel_id: if i % 2 == 0 { even } else { odd },
                sequence: i as u32,
                log_time: i,
                publish_time: i,
            },
            &i.to_le_bytes(),
        )?;
    }
    Ok(writer.into_inner()?.into_inner())
}

#[test]
fn time_range_filter() -> Result<()> {
    let mcap = write_two_channel_file(
        WriteOptions::new().compression(Some(Compression::Lz4)),
    )?;

    let messages: Vec<_> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new()
            .log_time_on_or_after(100)
            .log_time_before(200),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;

    assert_eq!(messages.len(), 100);
    for (message, expected_time) in messages.iter().zip_eq(100..200u64) {
        assert_eq!(message.log_time, expected_time);
    }
    Ok(())
}

#[test]
fn topic_filter() -> Result<()> {
    let mcap = write_two_channel_file(WriteOptions::new())?;
    let messages: Vec<_> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new().include_topics(["even"]),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 500);
    assert!(messages
        .iter()
        .all(|m| m.channel.topic == "even" && m.log_time % 2 == 0));
    Ok(())
}

#[test]
fn chunk_size_splits_chunks() -> Result<()> {
    // ~34 bytes per message record; a 1 KiB soft limit needs many chunks.
    let mcap = write_two_channel_file(WriteOptions::new().chunk_size(1024).compression(None))?;
    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("indexed file");
    assert!(summary.chunk_indexes.len() > 10);
    assert_eq!(
        summary.stats.as_ref().expect("stats").chunk_count as usize,
        summary.chunk_indexes.len()
    );
    // The soft limit means a chunk may run over by at most one message.
    for index in &summary.chunk_indexes {
        assert!(index.uncompressed_size <= 1024 + 64);
    }

    let messages: Vec<_> = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?
        .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 1000);
    Ok(())
}

#[test]
fn flush_cuts_a_chunk() -> Result<()> {
    let mut writer = WriteOptions::new().create(Cursor::new(Vec::new()))?;
    let channel = writer.add_channel(0, "/t", "json", &BTreeMap::new())?;
    for log_time in 0..4u64 {
        writer.write_message(
            &MessageHeader {
                channel_id: channel,
                sequence: log_time as u32,
                log_time,
                publish_time: log_time,
            },
            &[0],
        )?;
        writer.flush()?;
    }
    let mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("indexed file");
    assert_eq!(summary.chunk_indexes.len(), 4);
    for (index, log_time) in summary.chunk_indexes.iter().zip_eq(0..4u64) {
        assert_eq!(index.message_start_time, log_time);
        assert_eq!(index.message_end_time, log_time);
    }
    Ok(())
}

#[test]
fn chunk_index_bounds_cover_messages() -> Result<()> {
    let mcap = write_two_channel_file(WriteOptions::new().chunk_size(4096))?;
    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("indexed file");

    let mut counted = 0u64;
    for index in &summary.chunk_indexes {
        assert!(index.message_start_time <= index.message_end_time);
        // With message indexing on, every chunk lists both channels' entries.
        assert!(!index.message_index_offsets.is_empty());
        counted += 1;
    }
    assert_eq!(counted, summary.stats.unwrap().chunk_count as u64);
    Ok(())
}

#[test]
fn message_indexing_can_be_skipped() -> Result<()> {
    let mcap = write_two_channel_file(WriteOptions::new().skip_message_indexing(true))?;
    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("indexed file");
    for index in &summary.chunk_indexes {
        assert!(index.message_index_offsets.is_empty());
        assert_eq!(index.message_index_length, 0);
    }
    // Chunks can still be read; only the per-channel indexes are gone.
    let messages: Vec<_> = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?
        .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 1000);
    Ok(())
}

#[test]
fn summary_sections_can_be_skipped() -> Result<()> {
    let mcap = write_two_channel_file(
        WriteOptions::new()
            .skip_statistics(true)
            .skip_repeated_schemas(true)
            .skip_repeated_channel_infos(true)
            .skip_chunk_index(true)
            .skip_summary_offsets(true),
    )?;
    let footer = mcap_rs::read_footer(&mut Cursor::new(&mcap))?;
    assert_eq!(footer.summary_start, 0);
    assert_eq!(footer.summary_offset_start, 0);

    // No summary, but the data section still scans in file order.
    let messages: Vec<_> = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?
        .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 1000);
    Ok(())
}
