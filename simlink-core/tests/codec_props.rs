use std::net::Ipv4Addr;
use std::sync::OnceLock;

use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use simlink_core::message::BlockData;
use simlink_core::template::{BlockQuantity, BlockTemplate, FieldType, MessageTemplate};
use simlink_core::wire::{self, MAX_APPENDED_ACKS, MTU};
use simlink_core::{zerocode, FieldValue, MessageDictionary};
use uuid::Uuid;

fn dict() -> &'static MessageDictionary {
    static DICT: OnceLock<MessageDictionary> = OnceLock::new();
    DICT.get_or_init(|| MessageDictionary::bundled().unwrap())
}

fn finite_f32() -> impl Strategy<Value = f32> {
    -1.0e6f32..1.0e6f32
}

fn finite_f64() -> impl Strategy<Value = f64> {
    -1.0e9f64..1.0e9f64
}

fn value_strategy(kind: FieldType) -> BoxedStrategy<FieldValue> {
    match kind {
        FieldType::Null => Just(FieldValue::Null).boxed(),
        FieldType::Fixed(n) => prop::collection::vec(any::<u8>(), n)
            .prop_map(FieldValue::Fixed)
            .boxed(),
        FieldType::Variable(1) => prop::collection::vec(any::<u8>(), 0..=255)
            .prop_map(FieldValue::Variable)
            .boxed(),
        FieldType::Variable(_) => prop::collection::vec(any::<u8>(), 0..300)
            .prop_map(FieldValue::Variable)
            .boxed(),
        FieldType::U8 => any::<u8>().prop_map(FieldValue::U8).boxed(),
        FieldType::U16 => any::<u16>().prop_map(FieldValue::U16).boxed(),
        FieldType::U32 => any::<u32>().prop_map(FieldValue::U32).boxed(),
        FieldType::U64 => any::<u64>().prop_map(FieldValue::U64).boxed(),
        FieldType::S8 => any::<i8>().prop_map(FieldValue::S8).boxed(),
        FieldType::S16 => any::<i16>().prop_map(FieldValue::S16).boxed(),
        FieldType::S32 => any::<i32>().prop_map(FieldValue::S32).boxed(),
        FieldType::S64 => any::<i64>().prop_map(FieldValue::S64).boxed(),
        FieldType::F32 => finite_f32().prop_map(FieldValue::F32).boxed(),
        FieldType::F64 => finite_f64().prop_map(FieldValue::F64).boxed(),
        FieldType::Vector3 => [finite_f32(), finite_f32(), finite_f32()]
            .prop_map(FieldValue::Vector3)
            .boxed(),
        FieldType::Quaternion => [finite_f32(), finite_f32(), finite_f32()]
            .prop_map(FieldValue::Quaternion)
            .boxed(),
        FieldType::Vector3d => [finite_f64(), finite_f64(), finite_f64()]
            .prop_map(FieldValue::Vector3d)
            .boxed(),
        FieldType::Vector4 => [finite_f32(), finite_f32(), finite_f32(), finite_f32()]
            .prop_map(FieldValue::Vector4)
            .boxed(),
        FieldType::Uuid => any::<[u8; 16]>()
            .prop_map(|b| FieldValue::Uuid(Uuid::from_bytes(b)))
            .boxed(),
        FieldType::Bool => any::<bool>().prop_map(FieldValue::Bool).boxed(),
        FieldType::IpAddr => any::<[u8; 4]>()
            .prop_map(|b| FieldValue::IpAddr(Ipv4Addr::from(b)))
            .boxed(),
        FieldType::IpPort => any::<u16>().prop_map(FieldValue::IpPort).boxed(),
    }
}

fn block_strategy(block: &BlockTemplate) -> BoxedStrategy<Vec<Vec<FieldValue>>> {
    let instance: Vec<BoxedStrategy<FieldValue>> =
        block.fields.iter().map(|f| value_strategy(f.kind)).collect();
    let count = match block.quantity {
        BlockQuantity::Single => 1..=1,
        BlockQuantity::Multiple(n) => n as usize..=n as usize,
        BlockQuantity::Variable => 0..=3,
    };
    prop::collection::vec(instance, count).boxed()
}

fn message_strategy() -> impl Strategy<Value = (&'static MessageTemplate, BlockData)> {
    let templates: Vec<_> = dict().iter().collect();
    (0..templates.len()).prop_flat_map(move |i| {
        let template: &'static MessageTemplate = templates[i].as_ref();
        let blocks: Vec<_> = template.blocks.iter().map(block_strategy).collect();
        (Just(template), blocks)
    })
}

proptest! {
    #[test]
    fn zerocode_roundtrip(data in prop::collection::vec(prop_oneof![Just(0u8), any::<u8>()], 0..1500)) {
        let encoded = zerocode::encode(&data);
        prop_assert!(!encoded.windows(2).any(|w| w == [0, 0]));
        prop_assert_eq!(zerocode::decode(&encoded).unwrap(), data);
    }

    #[test]
    fn every_template_roundtrips(
        (template, blocks) in message_strategy(),
        seq in any::<u32>(),
        reliable in any::<bool>(),
        acks in prop::collection::vec(any::<u32>(), 0..8),
    ) {
        let bytes = wire::encode_datagram(template, &blocks, seq, reliable, &acks).unwrap();
        prop_assert!(bytes.len() <= MTU);
        prop_assert_eq!(bytes[0] & wire::FLAG_ZEROCODED != 0, template.is_zerocoded());

        let decoded = wire::decode_datagram(dict(), &bytes).unwrap();
        prop_assert_eq!(decoded.header.sequence, seq);
        prop_assert_eq!(decoded.header.is_reliable(), reliable);
        prop_assert_eq!(decoded.message.id(), template.id);
        prop_assert_eq!(decoded.message.blocks(), &blocks);
        prop_assert_eq!(decoded.acks, acks);
    }

    #[test]
    fn appended_acks_are_capped(count in 0usize..400) {
        let template = dict().by_name("CloseCircuit").unwrap();
        let acks: Vec<u32> = (0..count as u32).collect();
        match wire::encode_datagram(template, &Vec::new(), 1, false, &acks) {
            Ok(bytes) => {
                let decoded = wire::decode_datagram(dict(), &bytes).unwrap();
                prop_assert_eq!(decoded.acks.len(), count.min(MAX_APPENDED_ACKS));
            }
            Err(wire::WireError::TooLarge(n)) => prop_assert!(n > MTU),
            Err(e) => prop_assert!(false, "unexpected error {e}"),
        }
    }
}

#[test]
fn random_datagrams_never_panic() {
    let mut rng = StdRng::seed_from_u64(0x51_0d_0b);
    let mut buf = vec![0u8; MTU + 64];
    for _ in 0..20_000 {
        let len = rng.gen_range(0..buf.len());
        rng.fill(&mut buf[..len]);
        let _ = wire::decode_datagram(dict(), &buf[..len]);
    }
}

#[test]
fn mutated_datagrams_never_panic() {
    let mut rng = StdRng::seed_from_u64(7);
    let template = dict().by_name("TestMessage").unwrap();
    let blocks: BlockData = vec![
        vec![vec![FieldValue::U32(0)]],
        (0..4)
            .map(|i| vec![FieldValue::U32(i), FieldValue::U32(0), FieldValue::U32(1 << i)])
            .collect(),
    ];
    let valid = wire::encode_datagram(template, &blocks, 99, true, &[1, 2]).unwrap();
    for _ in 0..20_000 {
        let mut bytes = valid.clone();
        for _ in 0..rng.gen_range(1..4) {
            let i = rng.gen_range(0..bytes.len());
            bytes[i] = rng.gen();
        }
        if rng.gen_bool(0.3) {
            let cut = rng.gen_range(0..bytes.len());
            bytes.truncate(cut);
        }
        let _ = wire::decode_datagram(dict(), &bytes);
    }
}
