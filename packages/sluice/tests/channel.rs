use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use sluice::{
    error::{ReadError, WriteError},
    ByteChannel,
};
use std::{future::Future, task::Context, time::Duration};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_byte_loss_across_wraps() {
    // tiny capacity so the cursors lap the ring thousands of times
    let chan = ByteChannel::with_capacity(16, true);
    let data: Vec<u8> = {
        let mut rng = Pcg32::seed_from_u64(0xfeed);
        (0..64 * 1024).map(|_| rng.gen()).collect()
    };

    let writer = {
        let chan = chan.clone();
        let data = data.clone();
        tokio::spawn(async move {
            let mut rng = Pcg32::seed_from_u64(1);
            let mut off = 0;
            while off < data.len() {
                let n = rng.gen_range(1..=32).min(data.len() - off);
                chan.write_fully(&data[off..off + n]).await.unwrap();
                off += n;
            }
            chan.close(None);
        })
    };

    let mut read = Vec::new();
    let mut rng = Pcg32::seed_from_u64(2);
    let mut buf = [0u8; 32];
    loop {
        let want = rng.gen_range(1..=32usize);
        match chan.read_available(&mut buf[..want]).await.unwrap() {
            Some(n) => read.extend_from_slice(&buf[..n]),
            None => break,
        }
        // capacity invariant: the two sides plus anything claimed never
        // exceed the ring
        assert!(chan.available_for_read() + chan.available_for_write() <= 16);
    }
    writer.await.unwrap();

    assert_eq!(read.len(), data.len());
    assert_eq!(read, data);
    assert_eq!(chan.total_bytes_read(), data.len() as u64);
    assert_eq!(chan.total_bytes_written(), data.len() as u64);
}

#[tokio::test]
async fn wrap_straddled_scalars_are_not_torn() {
    // capacity 13 forces the second u64 to straddle the wrap point in both
    // directions: written via the reserved tail carry, read via the roll
    let chan = ByteChannel::with_capacity(13, true);

    chan.write_fully(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
    let mut first = [0u8; 4];
    chan.read_fully(&mut first).await.unwrap();
    assert_eq!(first, [1, 2, 3, 4]);

    // write cursor at 8, 8 more bytes wrap past 13
    chan.write_u64(0x0102_0304_0506_0708).await.unwrap();

    let mut rest = [0u8; 4];
    chan.read_fully(&mut rest).await.unwrap();
    assert_eq!(rest, [5, 6, 7, 8]);

    // read cursor at 8, the value spans the wrap
    assert_eq!(chan.read_u64().await.unwrap(), 0x0102_0304_0506_0708);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scalar_stream_survives_rebinds_and_wraps() {
    let chan = ByteChannel::with_capacity(13, true);
    let writer = {
        let chan = chan.clone();
        tokio::spawn(async move {
            for i in 0..500u64 {
                chan.write_u64(i.wrapping_mul(0x9e37_79b9_7f4a_7c15)).await.unwrap();
            }
        })
    };
    for i in 0..500u64 {
        assert_eq!(
            chan.read_u64().await.unwrap(),
            i.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        );
    }
    writer.await.unwrap();
}

#[test]
#[should_panic(expected = "read operation is already in progress")]
fn second_concurrent_read_panics() {
    let chan = ByteChannel::with_capacity(16, true);
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    let mut first = Box::pin(chan.read_u8());
    assert!(first.as_mut().poll(&mut cx).is_pending());

    let mut second = Box::pin(chan.read_u8());
    let _ = second.as_mut().poll(&mut cx);
}

#[test]
#[should_panic(expected = "write operation is already in progress")]
fn second_concurrent_write_panics() {
    let chan = ByteChannel::with_capacity(8, true);
    futures::executor::block_on(chan.write_fully(&[0; 8])).unwrap();

    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    // the ring is full, so this parks
    let mut first = Box::pin(chan.write_u8(1));
    assert!(first.as_mut().poll(&mut cx).is_pending());

    let mut second = Box::pin(chan.write_u8(2));
    let _ = second.as_mut().poll(&mut cx);
}

#[tokio::test]
async fn a_dropped_suspension_frees_the_slot() {
    let chan = ByteChannel::with_capacity(16, true);
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    let mut parked = Box::pin(chan.read_u8());
    assert!(parked.as_mut().poll(&mut cx).is_pending());
    drop(parked);

    // a fresh read is acceptable again
    chan.write_u8(42).await.unwrap();
    assert_eq!(chan.read_u8().await.unwrap(), 42);
}

#[tokio::test]
async fn close_is_idempotent_and_first_cause_wins() {
    let chan = ByteChannel::new(true);
    assert!(chan.close(None));
    assert!(!chan.close(None));
    assert!(!chan.cancel(Some(anyhow::anyhow!("too late"))));
    assert!(chan.closed_cause().is_none());

    let chan = ByteChannel::new(true);
    assert!(chan.cancel(Some(anyhow::anyhow!("boom"))));
    assert!(!chan.close(None));
    assert_eq!(chan.closed_cause().unwrap().to_string(), "boom");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_resumes_a_suspended_writer() {
    let chan = ByteChannel::with_capacity(8, true);
    chan.write_fully(&[0; 8]).await.unwrap();

    // the ring is full, so this parks
    let writer = {
        let chan = chan.clone();
        tokio::spawn(async move { chan.write_u8(1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    chan.close(None);
    assert!(matches!(
        writer.await.unwrap(),
        Err(WriteError::ClosedForWrite(_)),
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_resumes_a_suspended_writer_with_the_cause() {
    let chan = ByteChannel::with_capacity(8, true);
    chan.write_fully(&[0; 8]).await.unwrap();

    let writer = {
        let chan = chan.clone();
        tokio::spawn(async move { chan.write_u8(1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    chan.cancel(Some(anyhow::anyhow!("writer abandoned")));
    match writer.await.unwrap() {
        Err(WriteError::Closed(err)) => assert_eq!(err.cause.to_string(), "writer abandoned"),
        other => panic!("expected the failure cause, got {:?}", other),
    }
}

#[tokio::test]
async fn write_after_close_is_rejected() {
    let chan = ByteChannel::new(true);
    chan.close(None);
    assert!(matches!(
        chan.write_u8(1).await,
        Err(WriteError::ClosedForWrite(_)),
    ));
}

#[tokio::test]
async fn read_fully_names_the_shortfall_at_eof() {
    let chan = ByteChannel::with_capacity(16, true);
    chan.write_fully(&[1, 2]).await.unwrap();
    chan.close(None);

    let mut buf = [0u8; 5];
    match chan.read_fully(&mut buf).await {
        Err(ReadError::EndOfStream(eos)) => assert_eq!(eos.expected, 3),
        other => panic!("expected end of stream, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_resumes_when_writer_commits() {
    let chan = ByteChannel::with_capacity(16, false);
    let reader = {
        let chan = chan.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            chan.read_fully(&mut buf).await.unwrap();
            buf
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    chan.write_fully(&[9, 8, 7, 6]).await.unwrap();
    // not auto-flush: the reader stays parked until this
    chan.flush();
    assert_eq!(reader.await.unwrap(), [9, 8, 7, 6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_resumes_a_suspended_reader_with_the_cause() {
    let chan = ByteChannel::new(true);
    let reader = {
        let chan = chan.clone();
        tokio::spawn(async move { chan.read_u32().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    chan.cancel(Some(anyhow::anyhow!("upstream exploded")));
    assert!(matches!(reader.await.unwrap(), Err(ReadError::Closed(_))));
    assert!(chan.closed_cause().is_some());
}

#[tokio::test]
async fn unused_write_reservation_is_returned() {
    let chan = ByteChannel::with_capacity(16, true);
    let written = chan
        .write_with(1, |window| {
            assert!(!window.is_empty());
            window[..3].copy_from_slice(&[1, 2, 3]);
            3
        })
        .await
        .unwrap();
    assert_eq!(written, 3);
    assert_eq!(chan.available_for_read(), 3);
    assert_eq!(chan.available_for_write(), 13);

    let mut out = [0u8; 3];
    chan.read_fully(&mut out).await.unwrap();
    assert_eq!(out, [1, 2, 3]);
}

#[tokio::test]
async fn zero_consumption_read_window_is_a_peek() {
    let chan = ByteChannel::new(true);
    chan.write_fully(&[7, 8, 9]).await.unwrap();

    let consumed = chan
        .read_with(0, |window| {
            assert_eq!(window, &[7u8, 8, 9][..]);
            0
        })
        .await
        .unwrap();
    assert_eq!(consumed, 0);

    // nothing was taken
    assert_eq!(chan.read_u8().await.unwrap(), 7);
}

#[tokio::test]
async fn read_line_strips_crlf() {
    let chan = ByteChannel::new(true);
    chan.write_fully(b"hello\r\nworld\n").await.unwrap();
    chan.close(None);

    assert_eq!(chan.read_line(1024).await.unwrap().as_deref(), Some("hello"));
    assert_eq!(chan.read_line(1024).await.unwrap().as_deref(), Some("world"));
    assert_eq!(chan.read_line(1024).await.unwrap(), None);
}

#[tokio::test]
async fn read_until_gives_back_a_partial_tail_at_eof() {
    let chan = ByteChannel::new(true);
    chan.write_fully(b"no newline here").await.unwrap();
    chan.close(None);

    let mut out = Vec::new();
    assert_eq!(chan.read_until(b'\n', &mut out, 1024).await.unwrap(), Some(15));
    assert_eq!(out, b"no newline here");
}

#[tokio::test]
async fn read_until_respects_the_limit() {
    let chan = ByteChannel::new(true);
    chan.write_fully(&[b'x'; 100]).await.unwrap();

    let mut out = Vec::new();
    assert!(matches!(
        chan.read_until(b'\n', &mut out, 50).await,
        Err(ReadError::LineTooLong(_)),
    ));
}

#[test]
#[should_panic(expected = "requested bytes exceed channel capacity")]
fn oversized_read_window_request_panics() {
    let chan = ByteChannel::with_capacity(16, true);
    let _ = futures::executor::block_on(chan.read_with(17, |_| 0));
}

#[test]
#[should_panic(expected = "requested bytes exceed channel capacity")]
fn oversized_write_window_request_panics() {
    let chan = ByteChannel::with_capacity(16, true);
    let _ = futures::executor::block_on(chan.write_with(17, |_| 0));
}

#[test]
#[should_panic(expected = "requested bytes exceed channel capacity")]
fn oversized_await_content_request_panics() {
    let chan = ByteChannel::with_capacity(16, true);
    let _ = futures::executor::block_on(chan.await_content(17));
}

#[tokio::test]
async fn read_remaining_drains_to_end_of_stream() {
    let chan = ByteChannel::new(true);
    chan.write_fully(&[1, 2, 3, 4, 5]).await.unwrap();
    chan.close(None);

    assert_eq!(&chan.read_remaining(3).await.unwrap()[..], &[1, 2, 3]);
    assert_eq!(&chan.read_remaining(u64::MAX).await.unwrap()[..], &[4, 5]);
    assert!(chan.read_remaining(u64::MAX).await.unwrap().is_empty());
}

#[tokio::test]
async fn discard_stops_at_end_of_stream() {
    let chan = ByteChannel::new(true);
    chan.write_fully(&[0; 10]).await.unwrap();
    chan.close(None);

    assert_eq!(chan.discard(4).await.unwrap(), 4);
    assert_eq!(chan.discard(100).await.unwrap(), 6);
}

#[tokio::test]
async fn packets_round_trip() {
    let chan = ByteChannel::new(true);
    chan.write_packet(bytes::Bytes::from_static(b"packet payload"))
        .await
        .unwrap();

    let packet = chan.read_packet(14).await.unwrap();
    assert_eq!(&packet[..], b"packet payload");
}

#[tokio::test]
async fn await_content_reports_the_threshold() {
    let chan = ByteChannel::new(true);
    chan.write_fully(&[1, 2]).await.unwrap();

    assert!(chan.await_content(2).await.unwrap());
    chan.close(None);
    assert!(!chan.await_content(5).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_drains_source_into_destination() {
    let src = ByteChannel::new(true);
    let dst = ByteChannel::new(true);
    src.write_fully(&[1, 2, 3]).await.unwrap();

    let join = {
        let src = src.clone();
        let dst = dst.clone();
        tokio::spawn(async move { dst.join_from(&src, true).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    src.close(None);
    join.await.unwrap();

    assert!(dst.is_closed_for_write());
    let mut out = [0u8; 3];
    dst.read_fully(&mut out).await.unwrap();
    assert_eq!(out, [1, 2, 3]);
    assert_eq!(dst.read_available(&mut [0u8; 1]).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_after_joining_land_in_the_destination() {
    let src = ByteChannel::new(true);
    let dst = ByteChannel::new(true);
    src.write_fully(&[1]).await.unwrap();

    let join = {
        let src = src.clone();
        let dst = dst.clone();
        tokio::spawn(async move { dst.join_from(&src, true).await.unwrap() })
    };
    let feed = {
        let src = src.clone();
        tokio::spawn(async move {
            src.write_fully(&[2, 3]).await.unwrap();
            src.close(None);
        })
    };

    feed.await.unwrap();
    join.await.unwrap();

    let mut out = [0u8; 3];
    dst.read_fully(&mut out).await.unwrap();
    assert_eq!(out, [1, 2, 3]);
    assert!(dst.is_closed_for_write());
}

#[tokio::test]
async fn join_propagates_a_failure_to_the_destination() {
    let src = ByteChannel::new(true);
    let dst = ByteChannel::new(true);
    src.cancel(Some(anyhow::anyhow!("source failed")));

    dst.join_from(&src, true).await.unwrap();
    assert_eq!(dst.closed_cause().unwrap().to_string(), "source failed");
}

#[tokio::test]
async fn copy_to_moves_a_bounded_number_of_bytes() {
    let src = ByteChannel::new(true);
    let dst = ByteChannel::new(true);
    src.write_fully(&[1, 2, 3, 4, 5]).await.unwrap();

    assert_eq!(src.copy_to(&dst, 3).await.unwrap(), 3);

    let mut out = [0u8; 3];
    dst.read_fully(&mut out).await.unwrap();
    assert_eq!(out, [1, 2, 3]);
    assert_eq!(src.available_for_read(), 2);
}
