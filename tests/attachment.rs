use std::{borrow::Cow, collections::BTreeMap, io::Cursor, sync::Arc};

use anyhow::Result;

use mcap_rs::{
    records::AttachmentHeader, Attachment, Channel, McapError, Message, MessageIter, ReadOptions,
    Summary, WriteOptions, Writer,
};

fn demo_attachment() -> Attachment<'static> {
    Attachment {
        log_time: 100,
        create_time: 200,
        name: "my-attachment".into(),
        media_type: "application/octet-stream".into(),
        data: Cow::Owned(vec![1, 2, 3, 4, 5, 6]),
    }
}

#[test]
fn round_trip_through_index() -> Result<()> {
    let mut writer = WriteOptions::new()
        .include_crc(true)
        .create(Cursor::new(Vec::new()))?;
    writer.write_attachment(&demo_attachment())?;
    let mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("file has a summary");
    assert_eq!(summary.attachment_indexes.len(), 1);
    let index = &summary.attachment_indexes[0];
    assert_eq!(index.name, "my-attachment");
    assert_eq!(index.media_type, "application/octet-stream");
    assert_eq!(index.data_size, 6);
    assert_eq!(index.log_time, 100);
    assert_eq!(index.create_time, 200);
    assert_eq!(summary.stats.expect("stats").attachment_count, 1);

    let attachment = mcap_rs::read_attachment(&mut Cursor::new(&mcap), index)?;
    assert_eq!(attachment, demo_attachment());
    Ok(())
}

#[test]
fn streamed_in_parts() -> Result<()> {
    let mut writer = Writer::new(Cursor::new(Vec::new()))?;
    writer.start_attachment(
        6,
        AttachmentHeader {
            log_time: 100,
            create_time: 200,
            name: "my-attachment".into(),
            media_type: "application/octet-stream".into(),
        },
    )?;
    writer.put_attachment_bytes(&[1, 2, 3, 4])?;
    writer.put_attachment_bytes(&[5, 6])?;
    writer.finish_attachment()?;
    let mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("file has a summary");
    let attachment =
        mcap_rs::read_attachment(&mut Cursor::new(&mcap), &summary.attachment_indexes[0])?;
    assert_eq!(&attachment.data[..], &[1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[test]
fn tampered_attachment_fails_its_crc() -> Result<()> {
    let mut writer = WriteOptions::new()
        .include_crc(true)
        .create(Cursor::new(Vec::new()))?;
    writer.write_attachment(&demo_attachment())?;
    let mut mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("file has a summary");
    let index = summary.attachment_indexes[0].clone();
    // Flip a byte of attachment data; the trailing CRC no longer matches.
    let target = (index.offset + index.length) as usize - 5;
    mcap[target] ^= 0xff;

    assert!(matches!(
        mcap_rs::read_attachment(&mut Cursor::new(&mcap), &index),
        Err(McapError::BadAttachmentCrc { .. })
    ));
    Ok(())
}

#[test]
fn indexed_prefetch_honors_crc_option() -> Result<()> {
    // A chunked message forces the indexed path, which prefetches the
    // tampered attachment for the callback during construction.
    let channel = Arc::new(Channel {
        id: 0,
        topic: "/t".into(),
        schema: None,
        message_encoding: "json".into(),
        metadata: BTreeMap::new(),
    });
    let mut writer = WriteOptions::new()
        .include_crc(true)
        .create(Cursor::new(Vec::new()))?;
    writer.write(&Message {
        channel,
        sequence: 0,
        log_time: 1,
        publish_time: 1,
        data: Cow::Owned(vec![9]),
    })?;
    writer.write_attachment(&demo_attachment())?;
    let mut mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mut Cursor::new(&mcap))?.expect("file has a summary");
    let index = summary.attachment_indexes[0].clone();
    let target = (index.offset + index.length) as usize - 5;
    mcap[target] ^= 0xff;

    // CRC checking left at its default (off): construction succeeds and the
    // callback still fires.
    let seen = Arc::new(std::sync::Mutex::new(0usize));
    let sink = seen.clone();
    let messages: Vec<_> = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new().attachment_callback(Box::new(move |_, _| {
            *sink.lock().unwrap() += 1;
            Ok(())
        })),
    )?
    .collect::<mcap_rs::McapResult<_>>()?;
    assert_eq!(messages.len(), 1);
    assert_eq!(*seen.lock().unwrap(), 1);

    // Opting in surfaces the mismatch as soon as the reader is built.
    let err = MessageIter::new(
        Cursor::new(&mcap),
        ReadOptions::new()
            .compute_attachment_crcs(true)
            .attachment_callback(Box::new(|_, _| Ok(()))),
    )
    .err()
    .expect("construction should fail");
    assert!(matches!(err, McapError::BadAttachmentCrc { .. }));
    Ok(())
}

#[test]
fn attachment_callback_sees_every_attachment() -> Result<()> {
    let channel = Arc::new(Channel {
        id: 0,
        topic: "/t".into(),
        schema: None,
        message_encoding: "json".into(),
        metadata: BTreeMap::new(),
    });
    let mut writer = Writer::new(Cursor::new(Vec::new()))?;
    writer.write(&Message {
        channel,
        sequence: 0,
        log_time: 1,
        publish_time: 1,
        data: Cow::Owned(vec![9]),
    })?;
    writer.write_attachment(&demo_attachment())?;
    let mcap = writer.into_inner()?.into_inner();

    // Indexed and linear paths both surface attachments through the callback.
    for use_index in [true, false] {
        let seen: Arc<std::sync::Mutex<Vec<(String, Vec<u8>)>>> = Default::default();
        let sink = seen.clone();
        let options = ReadOptions::new()
            .use_index(use_index)
            .attachment_callback(Box::new(move |header, data| {
                sink.lock().unwrap().push((header.name.clone(), data.to_vec()));
                Ok(())
            }));
        let messages: Vec<_> =
            MessageIter::new(Cursor::new(&mcap), options)?.collect::<mcap_rs::McapResult<_>>()?;
        assert_eq!(messages.len(), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(
            &seen[..],
            &[("my-attachment".to_string(), vec![1, 2, 3, 4, 5, 6])]
        );
    }
    Ok(())
}
