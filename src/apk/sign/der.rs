//! Minimal DER writer and reader for the structures the signer produces.

use anyhow::Result;

pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const BIT_STRING: u8 = 0x03;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const UTF8_STRING: u8 = 0x0c;
    pub const PRINTABLE_STRING: u8 = 0x13;
    pub const UTC_TIME: u8 = 0x17;
    pub const GENERALIZED_TIME: u8 = 0x18;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;
    /// Constructed, context-specific `[0]`.
    pub const CONTEXT_0: u8 = 0xa0;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    Sequence(Vec<Node>),
    Set(Vec<Node>),
    /// Big-endian two's complement content.
    Integer(Vec<u8>),
    OctetString(Vec<u8>),
    BitString(Vec<u8>),
    Oid(&'static str),
    Null,
    Utf8String(String),
    PrintableString(String),
    UtcTime(String),
    GeneralizedTime(String),
    /// Constructed context-specific tag `[n]` around the children.
    Context(u8, Vec<Node>),
    /// An already encoded element, written as is.
    Raw(Vec<u8>),
}

impl Node {
    pub fn small_integer(value: u64) -> Self {
        Self::unsigned_integer(&value.to_be_bytes())
    }

    /// INTEGER holding the unsigned big-endian magnitude `bytes`.
    pub fn unsigned_integer(bytes: &[u8]) -> Self {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len().saturating_sub(1));
        let mut content = bytes[first.min(bytes.len())..].to_vec();
        if content.is_empty() {
            content.push(0);
        }
        if content[0] & 0x80 != 0 {
            content.insert(0, 0);
        }
        Self::Integer(content)
    }

    /// `AlgorithmIdentifier` with NULL parameters.
    pub fn algorithm(oid: &'static str) -> Self {
        Self::Sequence(vec![Self::Oid(oid), Self::Null])
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let (tag, content) = match self {
            Self::Sequence(children) => (tag::SEQUENCE, encode_all(children)?),
            Self::Set(children) => {
                // DER orders SET OF members by their encoding.
                let mut encoded = children
                    .iter()
                    .map(Node::encode)
                    .collect::<Result<Vec<_>>>()?;
                encoded.sort();
                (tag::SET, encoded.concat())
            }
            Self::Integer(bytes) => (tag::INTEGER, bytes.clone()),
            Self::OctetString(bytes) => (tag::OCTET_STRING, bytes.clone()),
            Self::BitString(bytes) => {
                let mut content = Vec::with_capacity(bytes.len() + 1);
                content.push(0);
                content.extend_from_slice(bytes);
                (tag::BIT_STRING, content)
            }
            Self::Oid(oid) => (tag::OID, encode_oid(oid)?),
            Self::Null => (tag::NULL, vec![]),
            Self::Utf8String(s) => (tag::UTF8_STRING, s.as_bytes().to_vec()),
            Self::PrintableString(s) => {
                anyhow::ensure!(
                    s.chars().all(is_printable),
                    "`{}` is not a printable string",
                    s
                );
                (tag::PRINTABLE_STRING, s.as_bytes().to_vec())
            }
            Self::UtcTime(s) => (tag::UTC_TIME, s.as_bytes().to_vec()),
            Self::GeneralizedTime(s) => (tag::GENERALIZED_TIME, s.as_bytes().to_vec()),
            Self::Context(n, children) => {
                anyhow::ensure!(*n < 31, "context tag {} needs the long form", n);
                (tag::CONTEXT_0 | n, encode_all(children)?)
            }
            Self::Raw(bytes) => {
                out.extend_from_slice(bytes);
                return Ok(());
            }
        };
        out.push(tag);
        encode_length(content.len(), out);
        out.extend_from_slice(&content);
        Ok(())
    }
}

fn encode_all(children: &[Node]) -> Result<Vec<u8>> {
    let mut out = vec![];
    for child in children {
        child.write(&mut out)?;
    }
    Ok(out)
}

fn is_printable(c: char) -> bool {
    c.is_ascii_alphanumeric() || " '()+,-./:=?".contains(c)
}

/// Definite-length encoding: short form below 128, long form otherwise.
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    out.push(0x80 | (bytes.len() - first) as u8);
    out.extend_from_slice(&bytes[first..]);
}

fn encode_oid(oid: &str) -> Result<Vec<u8>> {
    let arcs = oid
        .split('.')
        .map(|arc| arc.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| anyhow::anyhow!("invalid oid `{}`: {}", oid, err))?;
    anyhow::ensure!(arcs.len() >= 2 && arcs[0] <= 2, "invalid oid `{}`", oid);
    let mut out = vec![];
    let mut push_arc = |mut arc: u64| {
        let mut groups = vec![(arc & 0x7f) as u8];
        arc >>= 7;
        while arc > 0 {
            groups.push(0x80 | (arc & 0x7f) as u8);
            arc >>= 7;
        }
        out.extend(groups.iter().rev());
    };
    push_arc(arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        push_arc(*arc);
    }
    Ok(out)
}

/// One parsed element borrowing from the input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
    /// The whole element, header included.
    pub raw: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Parses the first element of `data`, returning it and the rest.
    pub fn parse(data: &'a [u8]) -> Result<(Self, &'a [u8])> {
        anyhow::ensure!(data.len() >= 2, "truncated DER element");
        let tag = data[0];
        anyhow::ensure!(tag & 0x1f != 0x1f, "multi-byte DER tags are not supported");
        let (len, header) = match data[1] {
            len if len < 0x80 => (len as usize, 2),
            0x80 => anyhow::bail!("indefinite DER length"),
            long => {
                let count = (long & 0x7f) as usize;
                anyhow::ensure!(count <= 4 && data.len() >= 2 + count, "bad DER length");
                let len = data[2..2 + count]
                    .iter()
                    .fold(0usize, |acc, b| (acc << 8) | *b as usize);
                (len, 2 + count)
            }
        };
        anyhow::ensure!(data.len() - header >= len, "DER element overruns its input");
        let end = header + len;
        Ok((
            Self {
                tag,
                content: &data[header..end],
                raw: &data[..end],
            },
            &data[end..],
        ))
    }

    /// Parses `data` as exactly one element.
    pub fn parse_single(data: &'a [u8]) -> Result<Self> {
        let (tlv, rest) = Self::parse(data)?;
        anyhow::ensure!(rest.is_empty(), "trailing bytes after DER element");
        Ok(tlv)
    }

    pub fn expect(self, tag: u8) -> Result<Self> {
        anyhow::ensure!(
            self.tag == tag,
            "expected DER tag 0x{:02x}, found 0x{:02x}",
            tag,
            self.tag
        );
        Ok(self)
    }

    pub fn children(&self) -> Result<Vec<Tlv<'a>>> {
        let mut children = vec![];
        let mut rest = self.content;
        while !rest.is_empty() {
            let (child, next) = Tlv::parse(rest)?;
            children.push(child);
            rest = next;
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_lengths() {
        let mut out = vec![];
        encode_length(0x7f, &mut out);
        encode_length(0x80, &mut out);
        encode_length(0x1234, &mut out);
        assert_eq!(out, [0x7f, 0x81, 0x80, 0x82, 0x12, 0x34]);
    }

    #[test]
    fn encodes_integers_with_sign_byte() {
        assert_eq!(Node::small_integer(0).encode().unwrap(), [0x02, 0x01, 0x00]);
        assert_eq!(Node::small_integer(1).encode().unwrap(), [0x02, 0x01, 0x01]);
        assert_eq!(Node::small_integer(0x80).encode().unwrap(), [0x02, 0x02, 0x00, 0x80]);
        assert_eq!(
            Node::unsigned_integer(&[0, 0, 0x12, 0x34]).encode().unwrap(),
            [0x02, 0x02, 0x12, 0x34]
        );
    }

    #[test]
    fn encodes_oids() {
        assert_eq!(
            Node::Oid("1.2.840.113549.1.1.11").encode().unwrap(),
            [0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]
        );
        assert_eq!(
            Node::algorithm("2.16.840.1.101.3.4.2.1").encode().unwrap(),
            [
                0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
                0x05, 0x00
            ]
        );
        assert!(Node::Oid("1.x").encode().is_err());
    }

    #[test]
    fn sorts_set_members() {
        let set = Node::Set(vec![Node::small_integer(2), Node::small_integer(1)]);
        assert_eq!(set.encode().unwrap(), [0x31, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn rejects_non_printable_strings() {
        assert!(Node::PrintableString("CN".into()).encode().is_ok());
        assert!(Node::PrintableString("a@b".into()).encode().is_err());
    }

    #[test]
    fn parses_nested_long_form() {
        let payload = vec![0xab; 300];
        let node = Node::Sequence(vec![
            Node::OctetString(payload.clone()),
            Node::Context(0, vec![Node::Null]),
        ]);
        let encoded = node.encode().unwrap();
        let seq = Tlv::parse_single(&encoded).unwrap().expect(tag::SEQUENCE).unwrap();
        let children = seq.children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].tag, tag::OCTET_STRING);
        assert_eq!(children[0].content, payload.as_slice());
        assert_eq!(children[1].tag, tag::CONTEXT_0);
        assert_eq!(children[1].content, [0x05, 0x00]);
        assert!(Tlv::parse(&encoded[..encoded.len() - 1]).is_err());
    }
}
