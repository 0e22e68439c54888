use crate::{
    AsyncRecord, ExtensionRecord, ExtensionType, KeyRecord, Record, SerError, TypeRegistry,
    FIRST_EXTENSION_TYPE_ID,
};
use bytes::Bytes;
use fxhash::FxHashMap;
use host::Reply;
use pretty_assertions::assert_eq;
use quickcheck::{Arbitrary, Gen};
use wire::Buffer;

fn round_trip(record: &Record, types: &TypeRegistry) -> Record {
    let mut buf = Buffer::new();
    record.serialize(types, &mut buf.writer()).expect("serialize");
    let mut r = buf.reader();
    let out = Record::deserialize(&mut r, types).expect("deserialize");
    assert!(r.is_exhausted(), "trailing bytes after deserialize");
    out
}

fn sample_records() -> Vec<Record> {
    let mut set = FxHashMap::default();
    set.insert("x".to_string(), Record::Long(3));
    set.insert("y".to_string(), Record::Double(2.5));

    vec![
        Record::Null,
        Record::string_from(""),
        Record::string(Bytes::from_static(b"binary\x00data")),
        Record::error_from("division by zero"),
        Record::Long(i64::MIN),
        Record::Double(f64::NAN),
        Record::Double(-0.125),
        Record::key("k1", Some(Record::string_from("v1"))),
        Record::key("k2", None),
        Record::List(vec![
            Record::Long(1),
            Record::List(vec![Record::Null]),
            Record::key("nested", Some(Record::Double(1.5))),
        ]),
        Record::HashSet(set),
    ]
}

#[test]
fn every_serializable_variant_round_trips() {
    let types = TypeRegistry::new();
    for record in sample_records() {
        assert_eq!(round_trip(&record, &types), record, "variant {}", record.type_name());
    }
}

#[test]
fn key_handler_refuses_wire_transit() {
    let types = TypeRegistry::new();
    struct FakeKey;
    impl host::OpenKey for FakeKey {
        fn name(&self) -> Bytes {
            Bytes::from_static(b"k")
        }
        fn key_type(&self) -> host::KeyType {
            host::KeyType::String
        }
        fn value(&self) -> Option<host::KeyValue> {
            None
        }
    }
    let record = Record::KeyHandler(host::KeyHandle(std::sync::Arc::new(FakeKey)));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut buf = Buffer::new();
        let _ = record.serialize(&types, &mut buf.writer());
    }));
    assert!(result.is_err());
}

#[test]
fn unfilled_async_is_a_recoverable_error() {
    let types = TypeRegistry::new();
    let pending = AsyncRecord::new(7);
    let record = Record::Async(pending.clone());

    let mut buf = Buffer::new();
    match record.serialize(&types, &mut buf.writer()) {
        Err(SerError::UnfilledAsync) => {}
        other => panic!("expected UnfilledAsync, got {other:?}"),
    }

    // Once continued, the placeholder serializes as its payload.
    assert!(pending.fill(Record::Long(42)));
    assert!(!pending.fill(Record::Long(43)), "fill is once-only");
    let mut buf = Buffer::new();
    record.serialize(&types, &mut buf.writer()).unwrap();
    let out = Record::deserialize(&mut buf.reader(), &types).unwrap();
    assert_eq!(out, Record::Long(42));
}

#[derive(Debug)]
struct GeoPoint {
    lat: f64,
    lon: f64,
}

impl ExtensionRecord for GeoPoint {
    fn type_name(&self) -> &str {
        "GeoPointRecord"
    }
    fn serialize(&self, w: &mut wire::BufferWriter<'_>) -> Result<(), SerError> {
        w.write_f64(self.lat);
        w.write_f64(self.lon);
        Ok(())
    }
    fn eq_record(&self, other: &dyn ExtensionRecord) -> bool {
        other.type_name() == self.type_name()
    }
}

#[test]
fn extension_types_append_after_builtins() {
    let types = TypeRegistry::new();
    let id = types.register(ExtensionType {
        name: "GeoPointRecord".to_string(),
        deserialize: Box::new(|r| {
            let lat = r.read_f64()?;
            let lon = r.read_f64()?;
            Ok(Record::Extension(Box::new(GeoPoint { lat, lon })))
        }),
    });
    assert_eq!(id, FIRST_EXTENSION_TYPE_ID);
    assert_eq!(types.id_of("GeoPointRecord"), Some(id));

    let record = Record::Extension(Box::new(GeoPoint { lat: 1.0, lon: -2.0 }));
    let out = round_trip(&record, &types);
    match out {
        Record::Extension(ext) => assert_eq!(ext.type_name(), "GeoPointRecord"),
        other => panic!("expected extension, got {other:?}"),
    }
}

#[test]
fn unknown_type_id_is_an_error_not_a_crash() {
    let types = TypeRegistry::new();
    let mut buf = Buffer::new();
    buf.writer().write_varu64(99);
    match Record::deserialize(&mut buf.reader(), &types) {
        Err(SerError::UnknownTypeId(99)) => {}
        other => panic!("expected UnknownTypeId, got {other:?}"),
    }
}

#[test]
fn reply_shapes_match_their_variants() {
    assert_eq!(Record::string_from("s").reply(), Reply::bulk_str("s"));
    assert_eq!(Record::Long(7).reply(), Reply::Integer(7));
    assert_eq!(Record::Double(0.5).reply(), Reply::Double(0.5));
    assert_eq!(Record::Null.reply(), Reply::Null);
    assert_eq!(
        Record::error_from("boom").reply(),
        Reply::Error("boom".to_string())
    );
    assert_eq!(
        Record::key("k", Some(Record::Long(1))).reply(),
        Reply::Array(vec![Reply::bulk_str("k"), Reply::Integer(1)])
    );
    assert_eq!(
        Record::key("k", None).reply(),
        Reply::Array(vec![Reply::bulk_str("k"), Reply::Null])
    );

    let mut set = FxHashMap::default();
    set.insert("b".to_string(), Record::Long(2));
    set.insert("a".to_string(), Record::Long(1));
    assert_eq!(
        Record::HashSet(set).reply(),
        Reply::Array(vec![
            Reply::Array(vec![Reply::bulk_str("a"), Reply::Integer(1)]),
            Reply::Array(vec![Reply::bulk_str("b"), Reply::Integer(2)]),
        ])
    );
}

#[test]
fn key_record_value_lifecycle() {
    let mut kr = KeyRecord::new("k", Some(Record::Long(1)));
    assert_eq!(kr.take_value(), Some(Record::Long(1)));
    assert_eq!(kr.take_value(), None);
    kr.set_value(Some(Record::Null));
    kr.set_value(None);
    assert_eq!(kr.value, None);
}

// quickcheck generator over the serializable subset, depth-bounded.
#[derive(Debug, Clone)]
struct WireRecord(RecordTree);

#[derive(Debug, Clone)]
enum RecordTree {
    Null,
    String(Vec<u8>),
    Error(Vec<u8>),
    Long(i64),
    Double(f64),
    Key(Vec<u8>, Option<Box<RecordTree>>),
    List(Vec<RecordTree>),
    HashSet(Vec<(String, RecordTree)>),
}

impl RecordTree {
    fn arbitrary_depth(g: &mut Gen, depth: usize) -> RecordTree {
        let scalar = depth == 0;
        match u8::arbitrary(g) % if scalar { 5 } else { 8 } {
            0 => RecordTree::Null,
            1 => RecordTree::String(Vec::arbitrary(g)),
            2 => RecordTree::Error(Vec::arbitrary(g)),
            3 => RecordTree::Long(i64::arbitrary(g)),
            4 => RecordTree::Double(f64::arbitrary(g)),
            5 => RecordTree::Key(
                Vec::arbitrary(g),
                bool::arbitrary(g)
                    .then(|| Box::new(RecordTree::arbitrary_depth(g, depth - 1))),
            ),
            6 => RecordTree::List(
                (0..u8::arbitrary(g) % 4)
                    .map(|_| RecordTree::arbitrary_depth(g, depth - 1))
                    .collect(),
            ),
            _ => RecordTree::HashSet(
                (0..u8::arbitrary(g) % 4)
                    .map(|i| (format!("k{i}"), RecordTree::arbitrary_depth(g, depth - 1)))
                    .collect(),
            ),
        }
    }

    fn build(&self) -> Record {
        match self {
            RecordTree::Null => Record::Null,
            RecordTree::String(b) => Record::String(Bytes::copy_from_slice(b)),
            RecordTree::Error(b) => Record::Error(Bytes::copy_from_slice(b)),
            RecordTree::Long(v) => Record::Long(*v),
            RecordTree::Double(v) => Record::Double(*v),
            RecordTree::Key(k, v) => Record::key(
                Bytes::copy_from_slice(k),
                v.as_ref().map(|v| v.build()),
            ),
            RecordTree::List(items) => {
                Record::List(items.iter().map(RecordTree::build).collect())
            }
            RecordTree::HashSet(entries) => {
                let mut map = FxHashMap::default();
                for (k, v) in entries {
                    map.insert(k.clone(), v.build());
                }
                Record::HashSet(map)
            }
        }
    }
}

impl Arbitrary for WireRecord {
    fn arbitrary(g: &mut Gen) -> Self {
        WireRecord(RecordTree::arbitrary_depth(g, 3))
    }
}

#[quickcheck_macros::quickcheck]
fn qc_record_round_trip(record: WireRecord) -> bool {
    let types = TypeRegistry::new();
    let record = record.0.build();
    round_trip(&record, &types) == record
}
