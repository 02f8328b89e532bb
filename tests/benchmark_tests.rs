//! Performance benchmarks for the hot protocol paths

use server::movement::MovementTracker;
use server::queue::QueuePair;
use shared::chat::wrap;
use shared::level;
use shared::{Dimensions, Message, Opcode, Position, Side};
use std::time::Instant;

/// Benchmarks encoding and decoding of the most frequent server packet
#[test]
fn benchmark_codec_movement_packets() {
    let message = Message::teleport(5, Position::new(1000, 2000, 3000, 64, 32));
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet = message.encode().unwrap();
        let decoded = Message::decode(Opcode::Teleport, &packet.bytes()[1..], Side::Server).unwrap();
        assert_eq!(decoded.opcode(), Opcode::Teleport);
    }

    let duration = start.elapsed();
    println!(
        "Teleport encode/decode: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks chat wrapping of long colored messages
#[test]
fn benchmark_chat_wrapping() {
    let text = "&aThis is a fairly long &cchat message &ethat has to be split over several \
                lines because it is far longer than sixty four characters &fin total";
    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let lines = wrap(text);
        assert!(lines.len() > 1);
    }

    let duration = start.elapsed();
    println!(
        "Chat wrapping: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks compressing and chunking a full default-size map
#[test]
fn benchmark_level_transfer() {
    let dimensions = Dimensions::new(128, 64, 128);
    let blocks: Vec<u8> = (0..dimensions.volume()).map(|i| (i % 7) as u8).collect();

    let start = Instant::now();
    let messages = level::transfer(&blocks, dimensions).unwrap();
    let duration = start.elapsed();

    println!(
        "Level transfer: {} blocks into {} packets in {:?}",
        blocks.len(),
        messages.len(),
        duration
    );

    assert!(matches!(messages.first(), Some(Message::LevelBegin)));
    assert!(matches!(messages.last(), Some(Message::LevelEnd(_))));
    // Should complete in under 5 seconds even in debug builds
    assert!(duration.as_secs() < 5);
}

/// Benchmarks movement delta computation for many players
#[test]
fn benchmark_movement_tracking() {
    let mut trackers: Vec<MovementTracker> = (0..128)
        .map(|i| MovementTracker::new(Position::new(i * 10, 100, 100, 0, 0)))
        .collect();

    let iterations = 1000;
    let start = Instant::now();
    let mut updates = 0;

    for step in 0..iterations {
        for (id, tracker) in trackers.iter_mut().enumerate() {
            let position = Position::new(id as i16 * 10 + (step % 20) as i16, 100, 100, 0, 0);
            if tracker.update(id as i8, position).is_some() {
                updates += 1;
            }
        }
    }

    let duration = start.elapsed();
    println!(
        "Movement tracking: {} updates from {} steps in {:?}",
        updates,
        iterations * trackers.len(),
        duration
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks draining outbound queues under a packet cap
#[test]
fn benchmark_queue_service() {
    let queues = QueuePair::new();
    let packet = Message::chat("benchmark").encode().unwrap();
    let iterations = 100_000;

    let start = Instant::now();
    for i in 0..iterations {
        if i % 10 == 0 {
            queues.push_priority(packet.clone());
        } else {
            queues.push(packet.clone());
        }
    }

    let mut sent = 0;
    while !queues.is_empty() {
        sent += queues.service(1000, |_| Ok(())).unwrap().sent;
    }
    let duration = start.elapsed();

    println!(
        "Queue service: {} packets in {:?} ({:.2} ns/packet)",
        sent,
        duration,
        duration.as_nanos() as f64 / sent as f64
    );

    assert_eq!(sent, iterations);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
