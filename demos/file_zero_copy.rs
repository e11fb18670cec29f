//! A sender beams a file region across to a receiver without copying
//! its bytes: the receiver gets a proxy over the same file handle, and
//! the sender is notified only once that proxy has been dropped.

use beam::{ArenaId, Beam, BlockingMode, Brigade, Bucket, Side};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn main() {
    let path = std::env::temp_dir().join(format!("beam_demo_{}.txt", std::process::id()));
    std::fs::File::create(&path)
        .and_then(|mut f| f.write_all(b"zero-copy payload"))
        .expect("write temp file");
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::File::open(&path).expect("reopen");

    let beam = Beam::new(0);
    let consumed = Arc::new(AtomicBool::new(false));
    let consumed_cb = consumed.clone();
    beam.on_consumed(
        || println!("sender notified: new data was consumed"),
        move |n| {
            println!("sender notified: {n} bytes consumed by the receiver");
            consumed_cb.store(true, Ordering::SeqCst);
        },
    );

    let sender_arena = ArenaId::fresh();
    let sender_beam = beam.clone();
    let sender = thread::spawn(move || {
        let mut out = Brigade::new();
        out.push_back(Bucket::file(sender_arena, file, 0, len));
        sender_beam.send(&mut out, BlockingMode::Blocking).expect("send");
        sender_beam.close(Side::Sender).expect("close");
    });

    let mut inbox = Brigade::new();
    beam.receive(&mut inbox, BlockingMode::Blocking, None).expect("receive");
    for bucket in inbox {
        assert!(bucket.is_proxy());
        println!("receiver got a {}-byte file proxy", bucket.length().unwrap());
    }
    // proxies drop here, triggering the sender's on_consumed callback

    sender.join().unwrap();
    beam.report_consumption();
    assert!(consumed.load(Ordering::SeqCst));
    let _ = std::fs::remove_file(&path);
}
