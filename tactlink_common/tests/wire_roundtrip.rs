//! Codec round-trip law: `decode(encode(batch)) == batch` for every
//! structurally valid batch, with `base_time_us` microsecond-exact.

use proptest::prelude::*;
use tactlink_common::consts::BATCH_EVENT_MAX;
use tactlink_common::event::{Batch, EventSpec};
use tactlink_common::wire::{decode, encode, Frame, FrameBuf};

fn arb_batch() -> impl Strategy<Value = Batch> {
    (
        any::<u32>(),
        any::<u64>(),
        -35_000_000i64..=35_000_000,
        any::<u16>(),
        proptest::collection::vec(0u16..2_000, 0..=BATCH_EVENT_MAX),
    )
        .prop_map(|(seq, base, offset, duration, delta_steps)| {
            let mut batch = Batch::new(seq, base, offset, duration);
            let mut delta = 0u16;
            for (i, step) in delta_steps.iter().enumerate() {
                delta = delta.saturating_add(*step);
                let spec = EventSpec {
                    delta_ms: delta,
                    finger: (i % 4) as u8,
                    amplitude: (i * 9 % 101) as u8,
                    freq_offset: (i * 7 % 52) as u8,
                };
                batch.events.push(spec).unwrap();
            }
            batch
        })
}

proptest! {
    #[test]
    fn macrocycle_roundtrip(batch in arb_batch()) {
        let mut buf = FrameBuf::new();
        encode(&Frame::Macrocycle(batch.clone()), &mut buf).unwrap();
        let parsed = decode(&buf[..buf.len() - 1]).unwrap().unwrap();
        prop_assert_eq!(parsed, Frame::Macrocycle(batch));
    }

    #[test]
    fn ping_pong_roundtrip(seq in any::<u32>(), t1 in any::<u64>(), t2 in any::<u64>(), t3 in any::<u64>()) {
        let mut buf = FrameBuf::new();
        encode(&Frame::Ping { seq, t1 }, &mut buf).unwrap();
        prop_assert_eq!(
            decode(&buf[..buf.len() - 1]).unwrap().unwrap(),
            Frame::Ping { seq, t1 }
        );

        encode(&Frame::Pong { seq, t2, t3 }, &mut buf).unwrap();
        prop_assert_eq!(
            decode(&buf[..buf.len() - 1]).unwrap().unwrap(),
            Frame::Pong { seq, t2, t3 }
        );
    }
}
