use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use tether::{ReliableChannel, ReliableConfig, SyncError};

fn config() -> ReliableConfig {
    ReliableConfig {
        fragment_size: 16,
        max_retries: 1000,
        ..Default::default()
    }
}

fn messages(rng: &mut StdRng, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let len = rng.gen_range(0..64);
            (0..len).map(|j| (i * 31 + j) as u8).collect()
        })
        .collect()
}

#[test]
fn any_permutation_delivers_once_in_order() {
    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sender = ReliableChannel::new(1, config());
        let mut receiver = ReliableChannel::new(2, config());
        let now = Instant::now();

        let sent = messages(&mut rng, 20);
        for message in &sent {
            sender.enqueue(message).unwrap();
        }

        let mut fragments = sender.collect_due(now, None).unwrap();
        let duplicates: Vec<_> = fragments
            .iter()
            .filter(|_| rng.gen_bool(0.3))
            .cloned()
            .collect();
        fragments.extend(duplicates);
        fragments.shuffle(&mut rng);

        for fragment in fragments {
            receiver.receive_fragment(fragment).unwrap();
        }
        let delivered: Vec<_> = receiver.drain_delivered().collect();
        assert_eq!(delivered, sent, "seed {seed}");
    }
}

#[test]
fn lossy_link_converges_through_retransmission() {
    for seed in 0..16 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sender = ReliableChannel::new(1, config());
        let mut receiver = ReliableChannel::new(2, config());
        let mut now = Instant::now();

        let sent = messages(&mut rng, 24);
        for message in &sent {
            sender.enqueue(message).unwrap();
        }

        let mut delivered = Vec::new();
        for _ in 0..500 {
            if sender.unacked_messages() == 0 {
                break;
            }
            let mut fragments: Vec<_> = sender
                .collect_due(now, None)
                .unwrap()
                .into_iter()
                .filter(|_| !rng.gen_bool(0.3))
                .collect();
            let duplicates: Vec<_> = fragments
                .iter()
                .filter(|_| rng.gen_bool(0.2))
                .cloned()
                .collect();
            fragments.extend(duplicates);
            fragments.shuffle(&mut rng);

            for fragment in fragments {
                receiver.receive_fragment(fragment).unwrap();
            }
            delivered.extend(receiver.drain_delivered());

            if !rng.gen_bool(0.3) {
                sender.process_ack(receiver.ack_sequence());
            }
            now += Duration::from_millis(150);
        }

        assert_eq!(sender.unacked_messages(), 0, "seed {seed}");
        assert_eq!(sender.outstanding_bytes(), 0);
        assert_eq!(delivered, sent, "seed {seed}");
    }
}

#[test]
fn dropped_second_message_is_not_skipped() {
    let mut sender = ReliableChannel::new(1, ReliableConfig::default());
    let mut receiver = ReliableChannel::new(2, ReliableConfig::default());
    let now = Instant::now();

    for payload in [b"one".as_slice(), b"two", b"three"] {
        sender.enqueue(payload).unwrap();
    }
    let first_round = sender.collect_due(now, None).unwrap();
    for fragment in first_round.into_iter().filter(|f| f.sequence != 2) {
        receiver.receive_fragment(fragment).unwrap();
    }
    let early: Vec<_> = receiver.drain_delivered().collect();
    assert_eq!(early, vec![b"one".to_vec()]);

    sender.process_ack(receiver.ack_sequence());
    let retry = sender.collect_due(now + Duration::from_millis(100), None).unwrap();
    assert!(retry.iter().all(|f| f.sequence != 1));
    for fragment in retry {
        receiver.receive_fragment(fragment).unwrap();
    }

    let late: Vec<_> = receiver.drain_delivered().collect();
    assert_eq!(late, vec![b"two".to_vec(), b"three".to_vec()]);
}

#[test]
fn unanswered_messages_report_a_dead_link() {
    let config = ReliableConfig {
        max_retries: 3,
        ..Default::default()
    };
    let mut sender = ReliableChannel::new(9, config);
    let mut now = Instant::now();
    sender.enqueue(b"lost").unwrap();

    for _ in 0..4 {
        assert!(sender.collect_due(now, None).is_ok());
        now += Duration::from_secs(3);
    }
    assert!(matches!(
        sender.collect_due(now, None),
        Err(SyncError::LinkTimeout { client_num: 9 })
    ));
}
