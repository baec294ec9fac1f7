use std::{collections::BTreeMap, io::Cursor};

use anyhow::Result;

use mcap_rs::{records::MessageHeader, MessageIter, ReadOptions, ReadOrder, WriteOptions};

/// Writes one chunk per inner slice, each message as `(channel_id, log_time)`.
fn write_chunks(chunks: &[&[(u16, u64)]]) -> Result<Vec<u8>> {
    let mut writer = WriteOptions::new()
        .compression(None)
        .create(Cursor::new(Vec::new()))?;
    let mut sequence = 0u32;
    for chunk in chunks {
        for &(id, log_time) in chunk.iter() {
            let topic = format!("/{id}");
            let channel_id = writer.add_channel(0, &topic, "json", &BTreeMap::new())?;
            assert_eq!(channel_id, id);
            writer.write_message(
                &MessageHeader {
                    channel_id,
                    sequence,
                    log_time,
                    publish_time: log_time,
                },
                &sequence.to_le_bytes(),
            )?;
            sequence += 1;
        }
        writer.flush()?;
    }
    Ok(writer.into_inner()?.into_inner())
}

fn read_times(mcap: &[u8], order: ReadOrder) -> Result<Vec<u64>> {
    let messages: Vec<_> = MessageIter::new(
        Cursor::new(mcap),
        ReadOptions::new().with_order(order),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;
    Ok(messages.iter().map(|m| m.log_time).collect())
}

#[test]
fn reverse_order_across_overlapping_chunks() -> Result<()> {
    // Chunk B's range [95, 175] straddles all of chunk A's [100, 150].
    let mcap = write_chunks(&[
        &[(0, 100), (0, 110), (0, 120), (0, 130), (0, 140), (0, 150)],
        &[(0, 95), (0, 155), (0, 165), (0, 175)],
    ])?;

    assert_eq!(
        read_times(&mcap, ReadOrder::ReverseLogTime)?,
        &[175, 165, 155, 150, 140, 130, 120, 110, 100, 95]
    );
    assert_eq!(
        read_times(&mcap, ReadOrder::LogTime)?,
        &[95, 100, 110, 120, 130, 140, 150, 155, 165, 175]
    );
    assert_eq!(
        read_times(&mcap, ReadOrder::File)?,
        &[100, 110, 120, 130, 140, 150, 95, 155, 165, 175]
    );
    Ok(())
}

#[test]
fn log_time_order_is_monotonic_with_disorder_in_chunks() -> Result<()> {
    let mcap = write_chunks(&[
        &[(0, 4), (0, 2), (0, 6)],
        &[(1, 5), (1, 3), (1, 1)],
        &[(2, 9), (2, 8), (2, 7)],
    ])?;
    let times = read_times(&mcap, ReadOrder::LogTime)?;
    assert_eq!(times, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);

    let mut reversed = read_times(&mcap, ReadOrder::ReverseLogTime)?;
    reversed.reverse();
    assert_eq!(times, reversed);
    Ok(())
}

#[test]
fn equal_times_break_ties_by_file_position() -> Result<()> {
    let mcap = write_chunks(&[&[(0, 5), (0, 5)], &[(1, 5), (1, 5)]])?;

    let forward: Vec<_> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new().with_order(ReadOrder::LogTime),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;
    let sequences: Vec<u32> = forward.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, &[0, 1, 2, 3]);

    let reverse: Vec<_> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new().with_order(ReadOrder::ReverseLogTime),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;
    let sequences: Vec<u32> = reverse.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, &[3, 2, 1, 0]);
    Ok(())
}

#[test]
fn time_range_is_half_open() -> Result<()> {
    let mcap = write_chunks(&[&[(0, 1), (0, 2), (0, 3), (0, 4), (0, 5), (0, 6)]])?;
    let times: Vec<u64> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new()
            .with_order(ReadOrder::LogTime)
            .log_time_on_or_after(3)
            .log_time_before(6),
    )?
    .map(|m| m.unwrap().log_time)
    .collect();
    assert_eq!(times, &[3, 4, 5]);
    Ok(())
}

#[test]
fn time_orders_need_chunk_indexes() -> Result<()> {
    // An unchunked file carries a summary but no chunk indexes, so the time
    // orders have nothing to drive them; only a file-order scan can serve it.
    let mut writer = WriteOptions::new()
        .use_chunks(false)
        .create(Cursor::new(Vec::new()))?;
    let channel = writer.add_channel(0, "/t", "json", &BTreeMap::new())?;
    for log_time in 0..3u64 {
        writer.write_message(
            &MessageHeader {
                channel_id: channel,
                sequence: log_time as u32,
                log_time,
                publish_time: log_time,
            },
            &[1],
        )?;
    }
    let mcap = writer.into_inner()?.into_inner();

    for order in [ReadOrder::LogTime, ReadOrder::ReverseLogTime] {
        let err = MessageIter::new(
            Cursor::new(&mcap),
            ReadOptions::new().with_order(order),
        )
        .err()
        .expect("construction should fail");
        assert!(matches!(err, mcap_rs::McapError::NoIndexAvailable));
    }

    // File order still reads every top-level message.
    let messages: Vec<_> = MessageIter::new(Cursor::new(&mcap), ReadOptions::new())?
        .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 3);
    Ok(())
}

#[test]
fn unindexed_reads_permit_only_file_order() {
    let mcap = write_chunks(&[&[(0, 1)]]).unwrap();
    let err = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new()
            .use_index(false)
            .with_order(ReadOrder::LogTime),
    )
    .err()
    .expect("construction should fail");
    assert!(matches!(err, mcap_rs::McapError::OrderRequiresIndex));
}
