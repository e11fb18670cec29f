//! A sender thread pushes a handful of heap buckets through a beam to a
//! receiver thread, closes, and the receiver drains until end-of-stream.

use beam::{ArenaId, Beam, BlockingMode, Brigade, Bucket, RecvOutcome, Side};
use std::thread;

fn main() {
    let beam = Beam::new(64 * 1024);
    let sender_arena = ArenaId::fresh();

    let sender_beam = beam.clone();
    let sender = thread::spawn(move || {
        for chunk in ["hello ", "beam ", "world"] {
            let mut out = Brigade::new();
            out.push_back(Bucket::heap(sender_arena, chunk.as_bytes().to_vec()));
            sender_beam.send(&mut out, BlockingMode::Blocking).expect("send");
        }
        sender_beam.close(Side::Sender).expect("close");
    });

    let mut received = Vec::new();
    loop {
        let mut inbox = Brigade::new();
        match beam.receive(&mut inbox, BlockingMode::Blocking, None).expect("receive") {
            RecvOutcome::Data { .. } => {
                for bucket in inbox {
                    if let Some(bytes) = bucket.as_bytes() {
                        received.extend_from_slice(bytes);
                    }
                }
            }
            RecvOutcome::Eof => break,
        }
    }

    sender.join().unwrap();
    println!("received: {}", String::from_utf8(received).unwrap());
}
