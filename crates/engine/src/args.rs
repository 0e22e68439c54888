use crate::Error;
use bytes::Bytes;
use wire::{BufferReader, BufferWriter};

/// Variant-tagged carrier for opaque operator arguments. Plugin-defined
/// payloads travel as `Opaque` and are interpreted by their registered
/// [`ArgTypeOps`]; everything the engine itself needs is a plain
/// variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Long(i64),
    Double(f64),
    Str(String),
    Bytes(Bytes),
    /// Two longs packed together (limit steps use offset + len).
    Pair(i64, i64),
    Opaque { type_name: String, data: Bytes },
}

const TAG_LONG: u64 = 0;
const TAG_DOUBLE: u64 = 1;
const TAG_STR: u64 = 2;
const TAG_BYTES: u64 = 3;
const TAG_PAIR: u64 = 4;
const TAG_OPAQUE: u64 = 5;

impl ArgValue {
    pub fn serialize(&self, w: &mut BufferWriter<'_>) {
        match self {
            ArgValue::Long(v) => {
                w.write_varu64(TAG_LONG);
                w.write_vari64(*v);
            }
            ArgValue::Double(v) => {
                w.write_varu64(TAG_DOUBLE);
                w.write_f64(*v);
            }
            ArgValue::Str(s) => {
                w.write_varu64(TAG_STR);
                w.write_str(s);
            }
            ArgValue::Bytes(b) => {
                w.write_varu64(TAG_BYTES);
                w.write_bytes(b);
            }
            ArgValue::Pair(a, b) => {
                w.write_varu64(TAG_PAIR);
                w.write_vari64(*a);
                w.write_vari64(*b);
            }
            ArgValue::Opaque { type_name, data } => {
                w.write_varu64(TAG_OPAQUE);
                w.write_str(type_name);
                w.write_bytes(data);
            }
        }
    }

    pub fn deserialize(r: &mut BufferReader<'_>) -> Result<ArgValue, Error> {
        Ok(match r.read_varu64()? {
            TAG_LONG => ArgValue::Long(r.read_vari64()?),
            TAG_DOUBLE => ArgValue::Double(r.read_f64()?),
            TAG_STR => ArgValue::Str(r.read_str()?.to_string()),
            TAG_BYTES => ArgValue::Bytes(Bytes::copy_from_slice(r.read_bytes()?)),
            TAG_PAIR => ArgValue::Pair(r.read_vari64()?, r.read_vari64()?),
            TAG_OPAQUE => ArgValue::Opaque {
                type_name: r.read_str()?.to_string(),
                data: Bytes::copy_from_slice(r.read_bytes()?),
            },
            tag => return Err(Error::Malformed(format!("unknown arg tag {tag}"))),
        })
    }
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::Long(v) => write!(f, "{v}"),
            ArgValue::Double(v) => write!(f, "{v}"),
            ArgValue::Str(s) => f.write_str(s),
            ArgValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            ArgValue::Pair(a, b) => write!(f, "({a}, {b})"),
            ArgValue::Opaque { type_name, data } => {
                write!(f, "<{type_name}: {} bytes>", data.len())
            }
        }
    }
}

/// Capability set of a registered argument type: how to serialize,
/// deserialize, duplicate, and format opaque operator arguments. The
/// version gates deserialization of payloads written by newer plugins.
pub trait ArgTypeOps: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> u32;

    fn serialize(&self, arg: &ArgValue, w: &mut BufferWriter<'_>) -> Result<(), Error>;
    fn deserialize(&self, r: &mut BufferReader<'_>, encver: u32) -> Result<ArgValue, Error>;

    fn dup(&self, arg: &ArgValue) -> ArgValue {
        arg.clone()
    }

    fn fmt(&self, arg: &ArgValue) -> String {
        arg.to_string()
    }
}

/// The stock argument type: the native [`ArgValue`] codec.
pub struct PlainArgType;

impl ArgTypeOps for PlainArgType {
    fn name(&self) -> &str {
        "plain"
    }

    fn version(&self) -> u32 {
        1
    }

    fn serialize(&self, arg: &ArgValue, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        arg.serialize(w);
        Ok(())
    }

    fn deserialize(&self, r: &mut BufferReader<'_>, _encver: u32) -> Result<ArgValue, Error> {
        ArgValue::deserialize(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::Buffer;

    #[test]
    fn arg_values_round_trip() {
        let args = [
            ArgValue::Long(-9),
            ArgValue::Double(1.25),
            ArgValue::Str("count".into()),
            ArgValue::Bytes(Bytes::from_static(b"\x00\x01")),
            ArgValue::Pair(2, 10),
            ArgValue::Opaque {
                type_name: "py".into(),
                data: Bytes::from_static(b"pickled"),
            },
        ];
        for arg in &args {
            let mut buf = Buffer::new();
            arg.serialize(&mut buf.writer());
            assert_eq!(&ArgValue::deserialize(&mut buf.reader()).unwrap(), arg);
        }
    }
}
