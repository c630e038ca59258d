// Single-page contract: round trip, fan-out replay, capacity boundary, reopen, empty reads.
use std::sync::Arc;
use std::thread;

use filebuffer::api::{EOF_MARKER, HEADER_LEN, Page, ReadOutcome};

fn drain(page: &Arc<Page>) -> (Vec<Vec<u8>>, ReadOutcome) {
    let mut reader = page.open_for_read().expect("reader");
    let mut chunks = Vec::new();
    loop {
        match reader.read().expect("read") {
            ReadOutcome::Chunk(chunk) => chunks.push(chunk.to_vec()),
            end => return (chunks, end),
        }
    }
}

#[test]
fn written_chunks_read_back_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let page = Arc::new(Page::create(temp.path().join("rt.page"), 0, 4096, 1).expect("create"));
    let chunks: Vec<Vec<u8>> = vec![
        b"a".to_vec(),
        vec![0u8; 300],
        (0..=255u8).collect(),
        b"last chunk".to_vec(),
    ];
    for chunk in &chunks {
        assert_eq!(page.write(&mut &chunk[..]).expect("write"), chunk.len());
    }

    let (read, end) = drain(&page);
    assert_eq!(read, chunks);
    assert_eq!(end, ReadOutcome::Empty);
}

#[test]
fn independent_readers_replay_the_same_records() {
    let temp = tempfile::tempdir().expect("tempdir");
    let page = Arc::new(Page::create(temp.path().join("fan.page"), 0, 8192, 1).expect("create"));
    let expected = (0..50)
        .map(|i| format!("record-{i}").into_bytes())
        .collect::<Vec<_>>();
    for chunk in &expected {
        page.write(&mut &chunk[..]).expect("write");
    }

    let handles = (0..8)
        .map(|_| {
            let page = Arc::clone(&page);
            thread::spawn(move || drain(&page).0)
        })
        .collect::<Vec<_>>();

    // a reader opened on this thread, read half way, must not disturb the others
    let mut partial = page.open_for_read().expect("reader");
    for _ in 0..25 {
        partial.read().expect("read");
    }

    for handle in handles {
        assert_eq!(handle.join().expect("join"), expected);
    }
    assert_eq!(
        partial.read().expect("read").into_chunk().as_deref(),
        Some(&b"record-25"[..])
    );
}

#[test]
fn readers_follow_a_concurrent_writer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let page = Arc::new(Page::create(temp.path().join("live.page"), 0, 16 * 1024, 1).expect("create"));

    let writer = {
        let page = Arc::clone(&page);
        thread::spawn(move || {
            for i in 0..200u32 {
                page.write(&mut &i.to_le_bytes()[..]).expect("write");
            }
            page.seal().expect("seal");
        })
    };

    let readers = (0..4)
        .map(|_| {
            let page = Arc::clone(&page);
            thread::spawn(move || {
                let mut reader = page.open_for_read().expect("reader");
                let mut seen = Vec::new();
                loop {
                    match reader.read().expect("read") {
                        ReadOutcome::Chunk(chunk) => {
                            let mut raw = [0u8; 4];
                            raw.copy_from_slice(&chunk);
                            seen.push(u32::from_le_bytes(raw));
                        }
                        ReadOutcome::Empty => thread::yield_now(),
                        ReadOutcome::EndOfPage => return seen,
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    writer.join().expect("writer");
    for reader in readers {
        assert_eq!(reader.join().expect("reader"), (0..200).collect::<Vec<_>>());
    }
}

#[test]
fn first_chunk_that_does_not_fit_leaves_eof_marker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("cap.page");
    let page = Arc::new(Page::create(&path, 0, 100, 1).expect("create"));

    let mut written = Vec::new();
    loop {
        let chunk = vec![written.len() as u8 + 1; 10];
        let remaining = page.remaining_for_write().expect("remaining");
        let consumed = page.write(&mut &chunk[..]).expect("write");
        if consumed == 0 {
            assert!(remaining < chunk.len());
            break;
        }
        written.push(chunk);
    }
    assert_eq!(written.len(), 5);
    page.close_for_write().expect("close");

    let raw = std::fs::read(&path).expect("read file");
    let end = HEADER_LEN + written.len() * (4 + 10);
    assert_eq!(&raw[end..end + 4], &EOF_MARKER.to_le_bytes());

    let mut reader = page.open_for_read().expect("reader");
    for chunk in &written {
        assert_eq!(reader.read().expect("read").into_chunk().as_deref(), Some(&chunk[..]));
    }
    assert_eq!(reader.offset(), end);
    assert!(reader.is_read_complete().expect("complete"));
    assert_eq!(reader.read().expect("read"), ReadOutcome::EndOfPage);
}

#[test]
fn append_resumes_after_reopen() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("resume.page");
    {
        let page = Page::create(&path, 0, 256, 1).expect("create");
        page.write(&mut &b"A"[..]).expect("write");
        page.write(&mut &b"BB"[..]).expect("write");
        page.close_for_write().expect("close");
    }

    let page = Arc::new(Page::open(&path, 0, 256));
    page.open_for_write().expect("reopen");
    page.write(&mut &b"CCC"[..]).expect("write");
    page.close_for_write().expect("close");

    let (read, _) = drain(&page);
    assert_eq!(read, vec![b"A".to_vec(), b"BB".to_vec(), b"CCC".to_vec()]);
    assert_eq!(page.header().expect("header").page_index, 1);
}

#[test]
fn empty_page_reads_empty_until_written() {
    let temp = tempfile::tempdir().expect("tempdir");
    let page = Arc::new(Page::create(temp.path().join("empty.page"), 0, 128, 1).expect("create"));
    let mut reader = page.open_for_read().expect("reader");
    for _ in 0..5 {
        assert_eq!(reader.read().expect("read"), ReadOutcome::Empty);
        assert_eq!(reader.offset(), HEADER_LEN);
    }
    page.write(&mut &b"now"[..]).expect("write");
    assert_eq!(reader.read().expect("read").into_chunk().as_deref(), Some(&b"now"[..]));
}

#[test]
fn two_four_byte_chunks_fill_the_page() {
    let temp = tempfile::tempdir().expect("tempdir");
    let page = Arc::new(
        Page::create(temp.path().join("two.page"), 0, HEADER_LEN + 2 * (4 + 4) + 4, 1)
            .expect("create"),
    );
    assert_eq!(page.write(&mut &b"AAAA"[..]).expect("write"), 4);
    assert_eq!(page.write(&mut &b"BBBB"[..]).expect("write"), 4);
    let mut rejected = &b"CCCC"[..];
    assert_eq!(page.write(&mut rejected).expect("write"), 0);
    assert_eq!(rejected, b"CCCC");
    assert!(page.is_sealed().expect("sealed"));

    let mut reader = page.open_for_read().expect("reader");
    assert_eq!(reader.read().expect("read").into_chunk().as_deref(), Some(&b"AAAA"[..]));
    assert_eq!(reader.read().expect("read").into_chunk().as_deref(), Some(&b"BBBB"[..]));
    assert_eq!(reader.read().expect("read"), ReadOutcome::EndOfPage);
    assert!(reader.is_read_complete().expect("complete"));
}
