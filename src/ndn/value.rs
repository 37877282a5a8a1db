//! Abstract value tree and dotted-path accessors.

use bytes::Bytes;

/// Errors raised by value accessors and the text parser
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NdnError {
    #[error("no value at '{0}'")]
    NotFound(String),

    #[error("value at '{path}' is not {expected}")]
    WrongType { path: String, expected: &'static str },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

/// A node of an abstract (ASN.1-style) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsnValue {
    Integer(i64),
    Octets(Bytes),
    /// Named fields in declaration order
    Sequence(Vec<(String, AsnValue)>),
    SequenceOf(Vec<AsnValue>),
    /// Selected alternative: label and its value
    Choice(String, Box<AsnValue>),
}

enum Segment<'a> {
    Label(&'a str),
    Index(usize),
    Name(&'a str),
}

fn segments(path: &str) -> impl Iterator<Item = Segment<'_>> {
    path.split('.').filter(|s| !s.is_empty()).map(|s| {
        if let Some(label) = s.strip_prefix('#') {
            Segment::Label(label)
        } else if let Ok(index) = s.parse::<usize>() {
            Segment::Index(index)
        } else {
            Segment::Name(s)
        }
    })
}

impl AsnValue {
    pub fn octets(data: impl Into<Bytes>) -> Self {
        AsnValue::Octets(data.into())
    }

    pub fn string(text: &str) -> Self {
        AsnValue::Octets(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn choice(label: &str, value: AsnValue) -> Self {
        AsnValue::Choice(label.to_string(), Box::new(value))
    }

    pub fn empty() -> Self {
        AsnValue::Sequence(Vec::new())
    }

    /// Resolve a dotted path. An empty path is the value itself.
    pub fn get(&self, path: &str) -> Result<&AsnValue, NdnError> {
        let mut node = self;
        for seg in segments(path) {
            node = match (seg, node) {
                (Segment::Label(label), AsnValue::Choice(l, inner)) if l == label => inner,
                (Segment::Index(i), AsnValue::SequenceOf(items)) if i < items.len() => &items[i],
                (Segment::Name(name), AsnValue::Sequence(fields)) => fields
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| NdnError::NotFound(path.to_string()))?,
                // a bare segment also selects a choice alternative on read
                (Segment::Name(name), AsnValue::Choice(l, inner)) if l == name => inner,
                _ => return Err(NdnError::NotFound(path.to_string())),
            };
        }
        Ok(node)
    }

    /// Like `get`, then looks through any choice wrappers to the leaf.
    fn leaf(&self, path: &str) -> Result<&AsnValue, NdnError> {
        let mut node = self.get(path)?;
        while let AsnValue::Choice(_, inner) = node {
            node = inner;
        }
        Ok(node)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// String length for octet leaves, element count for containers,
    /// `size_of::<i64>()` for integers.
    pub fn get_length(&self, path: &str) -> Result<usize, NdnError> {
        Ok(match self.leaf(path)? {
            AsnValue::Integer(_) => std::mem::size_of::<i64>(),
            AsnValue::Octets(data) => data.len(),
            AsnValue::Sequence(fields) => fields.len(),
            AsnValue::SequenceOf(items) => items.len(),
            AsnValue::Choice(..) => unreachable!("leaf() strips choices"),
        })
    }

    /// Copy the octet string at `path` into `buf`, returning its length.
    pub fn read_value(&self, path: &str, buf: &mut [u8]) -> Result<usize, NdnError> {
        let data = self.read_octets(path)?;
        if data.len() > buf.len() {
            return Err(NdnError::BufferTooSmall {
                needed: data.len(),
                available: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    pub fn read_octets(&self, path: &str) -> Result<&Bytes, NdnError> {
        match self.leaf(path)? {
            AsnValue::Octets(data) => Ok(data),
            _ => Err(NdnError::WrongType {
                path: path.to_string(),
                expected: "an octet string",
            }),
        }
    }

    pub fn read_integer(&self, path: &str) -> Result<i64, NdnError> {
        match self.leaf(path)? {
            AsnValue::Integer(v) => Ok(*v),
            _ => Err(NdnError::WrongType {
                path: path.to_string(),
                expected: "an integer",
            }),
        }
    }

    /// Element `index` of this sequence-of, then `path` below it.
    pub fn read_indexed(&self, index: usize, path: &str) -> Result<&AsnValue, NdnError> {
        match self {
            AsnValue::SequenceOf(items) => items
                .get(index)
                .ok_or_else(|| NdnError::NotFound(format!("{}", index)))?
                .get(path),
            _ => Err(NdnError::WrongType {
                path: String::new(),
                expected: "a sequence-of",
            }),
        }
    }

    /// Store `value` at `path`, creating intermediate nodes as needed.
    ///
    /// `#label` segments create (or switch) choice alternatives, bare names
    /// create sequence fields and numeric segments may append one element
    /// to a sequence-of.
    pub fn write_field(&mut self, path: &str, value: AsnValue) -> Result<(), NdnError> {
        let segs: Vec<Segment<'_>> = segments(path).collect();
        write_at(self, &segs, value, path)
    }
}

fn write_at(
    node: &mut AsnValue,
    segs: &[Segment<'_>],
    value: AsnValue,
    path: &str,
) -> Result<(), NdnError> {
    let Some((seg, rest)) = segs.split_first() else {
        *node = value;
        return Ok(());
    };

    match seg {
        Segment::Label(label) => {
            let matches = matches!(node, AsnValue::Choice(l, _) if l.as_str() == *label);
            if !matches {
                *node = AsnValue::choice(label, AsnValue::empty());
            }
            match node {
                AsnValue::Choice(_, inner) => write_at(inner, rest, value, path),
                _ => unreachable!(),
            }
        }
        Segment::Index(index) => {
            if matches!(node, AsnValue::Sequence(f) if f.is_empty()) {
                *node = AsnValue::SequenceOf(Vec::new());
            }
            match node {
                AsnValue::SequenceOf(items) => {
                    if *index == items.len() {
                        items.push(AsnValue::empty());
                    }
                    match items.get_mut(*index) {
                        Some(item) => write_at(item, rest, value, path),
                        None => Err(NdnError::NotFound(path.to_string())),
                    }
                }
                _ => Err(NdnError::WrongType {
                    path: path.to_string(),
                    expected: "a sequence-of",
                }),
            }
        }
        Segment::Name(name) => match node {
            AsnValue::Choice(l, inner) if l.as_str() == *name => write_at(inner, rest, value, path),
            AsnValue::Sequence(fields) => {
                let pos = match fields.iter().position(|(n, _)| n.as_str() == *name) {
                    Some(pos) => pos,
                    None => {
                        fields.push((name.to_string(), AsnValue::empty()));
                        fields.len() - 1
                    }
                };
                write_at(&mut fields[pos].1, rest, value, path)
            }
            _ => Err(NdnError::WrongType {
                path: path.to_string(),
                expected: "a sequence",
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AsnValue {
        AsnValue::Sequence(vec![
            ("conn-type".into(), AsnValue::Integer(1)),
            (
                "conn-params".into(),
                AsnValue::choice(
                    "telnet",
                    AsnValue::Sequence(vec![
                        ("host".into(), AsnValue::choice("plain", AsnValue::string("dut"))),
                        ("port".into(), AsnValue::choice("plain", AsnValue::Integer(23))),
                    ]),
                ),
            ),
            (
                "items".into(),
                AsnValue::SequenceOf(vec![AsnValue::Integer(7), AsnValue::Integer(8)]),
            ),
        ])
    }

    #[test]
    fn test_bare_and_label_paths_agree() {
        let v = sample();
        assert_eq!(
            v.get("conn-params.telnet.host.plain").unwrap(),
            v.get("conn-params.#telnet.host.#plain").unwrap()
        );
        assert!(v.get("conn-params.#ssh.host").is_err());
    }

    #[test]
    fn test_get_length() {
        let v = sample();
        assert_eq!(v.get_length("conn-params.telnet.host").unwrap(), 3);
        assert_eq!(v.get_length("conn-type").unwrap(), 8);
        assert_eq!(v.get_length("items").unwrap(), 2);
        assert!(matches!(v.get_length("user"), Err(NdnError::NotFound(_))));
    }

    #[test]
    fn test_read_value_and_buffer_too_small() {
        let v = sample();
        let mut buf = [0u8; 8];
        let n = v.read_value("conn-params.telnet.host.plain", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"dut");

        let mut small = [0u8; 2];
        assert_eq!(
            v.read_value("conn-params.telnet.host", &mut small),
            Err(NdnError::BufferTooSmall { needed: 3, available: 2 })
        );
        assert!(matches!(
            v.read_value("conn-type", &mut buf),
            Err(NdnError::WrongType { .. })
        ));
    }

    #[test]
    fn test_read_integer_and_indexed() {
        let v = sample();
        assert_eq!(v.read_integer("conn-params.telnet.port").unwrap(), 23);
        assert_eq!(v.read_integer("items.1").unwrap(), 8);

        let items = v.get("items").unwrap();
        assert_eq!(items.read_indexed(0, "").unwrap(), &AsnValue::Integer(7));
        assert!(items.read_indexed(5, "").is_err());
        assert!(v.read_indexed(0, "").is_err());
    }

    #[test]
    fn test_write_field_creates_intermediate_nodes() {
        let mut v = AsnValue::empty();
        v.write_field("cli.message.#plain", AsnValue::string("hi"))
            .unwrap();
        assert_eq!(v.read_octets("cli.message.plain").unwrap().as_ref(), b"hi");

        // overwrite in place, no duplicate field
        v.write_field("cli.message.#plain", AsnValue::string("again"))
            .unwrap();
        match v.get("cli").unwrap() {
            AsnValue::Sequence(fields) => assert_eq!(fields.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            v.read_octets("cli.message").unwrap().as_ref(),
            b"again"
        );
    }

    #[test]
    fn test_write_field_appends_to_list() {
        let mut v = AsnValue::empty();
        v.write_field("pdus.0.#cli", AsnValue::empty()).unwrap();
        v.write_field("pdus.1", AsnValue::Integer(3)).unwrap();
        assert_eq!(v.get_length("pdus").unwrap(), 2);
        assert!(v.write_field("pdus.5", AsnValue::Integer(1)).is_err());
        assert!(v.write_field("pdus.1.x", AsnValue::Integer(1)).is_err());
    }
}
