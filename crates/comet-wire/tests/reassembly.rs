use bytes::{Bytes, BytesMut};
use comet_wire::{Frame, FrameCodec, FrameDecoder, FrameError};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

fn stream_of(payloads: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for payload in payloads {
        Frame::new(payload.clone())
            .expect("frame")
            .encode_into(&mut buf);
    }
    buf.freeze()
}

fn sample_payloads() -> Vec<Bytes> {
    vec![
        Bytes::from_static(br#"<voe:VOEvent role="test" ivorn="ivo://x.y/z#1"/>"#),
        Bytes::new(),
        Bytes::from(vec![0xAB; 300]),
        Bytes::from_static(b"x"),
    ]
}

#[test]
fn every_two_way_split_reassembles_exactly() {
    let payloads = sample_payloads();
    let wire = stream_of(&payloads);
    for split in 0..=wire.len() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in [&wire[..split], &wire[split..]] {
            buf.extend_from_slice(chunk);
            while let Some(payload) = decoder.decode(&mut buf).expect("decode") {
                out.push(payload);
            }
        }
        assert_eq!(out, payloads, "split at {split}");
        assert!(buf.is_empty());
    }
}

#[test]
fn byte_at_a_time_never_loses_or_duplicates() {
    let payloads = sample_payloads();
    let wire = stream_of(&payloads);
    let mut decoder = FrameDecoder::default();
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    for byte in wire.iter() {
        buf.extend_from_slice(&[*byte]);
        while let Some(payload) = decoder.decode(&mut buf).expect("decode") {
            out.push(payload);
        }
    }
    assert_eq!(out, payloads);
}

#[tokio::test]
async fn framed_read_over_chunked_socket() {
    let payloads = sample_payloads();
    let wire = stream_of(&payloads);
    let (mut writer, reader) = tokio::io::duplex(16);
    let feeder = tokio::spawn(async move {
        for chunk in wire.chunks(7) {
            writer.write_all(chunk).await.expect("write");
        }
    });

    let mut framed = FramedRead::new(reader, FrameCodec::default());
    let mut out = Vec::new();
    while let Some(payload) = framed.next().await {
        out.push(payload.expect("frame"));
    }
    feeder.await.expect("feeder");
    assert_eq!(out, payloads);
}

#[tokio::test]
async fn oversized_frame_terminates_the_stream() {
    let wire = stream_of(&[Bytes::from(vec![b'a'; 64])]);
    let (mut writer, reader) = tokio::io::duplex(128);
    writer.write_all(&wire).await.expect("write");
    drop(writer);

    let mut framed = FramedRead::new(reader, FrameCodec::new(32));
    let first = framed.next().await.expect("item");
    assert!(matches!(first, Err(FrameError::TooLarge { length: 64, max: 32 })));
}
