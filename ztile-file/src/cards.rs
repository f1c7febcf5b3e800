//! 80-byte ASCII header cards.
//!
//! The header of every table is a sequence of `KEY = value / comment` cards,
//! padded with blanks to a multiple of 36 cards (one 2880-byte block). Keys
//! are at most 8 characters from `[A-Z0-9_-]`; string values are quoted and
//! padded to at least 8 characters, numbers and booleans are right-aligned to
//! column 30.

use std::fmt::Display;

use ztile_error::{ztile_bail, ZTileResult};

pub const CARD_SIZE: usize = 80;
pub const CARDS_PER_BLOCK: usize = 36;

#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Commentary card: no `= ` delimiter, the text occupies the value area.
    None,
}

#[derive(Debug, Clone)]
pub struct Card {
    key: String,
    value: CardValue,
    comment: String,
}

fn check_key(key: &str) -> ZTileResult<()> {
    if key.is_empty() {
        return Ok(());
    }
    if key.len() > 8 {
        ztile_bail!(Configuration: "header key '{}' exceeds 8 bytes", key);
    }
    for c in key.chars() {
        if !c.is_ascii_uppercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
            ztile_bail!(Configuration: "invalid character '{}' in header key '{}'", c, key);
        }
    }
    Ok(())
}

impl Card {
    pub fn new(key: &str, value: CardValue, comment: &str) -> ZTileResult<Self> {
        check_key(key)?;
        for c in comment.chars() {
            if !(' '..='~').contains(&c) {
                ztile_bail!(Configuration: "invalid character in comment of key '{}'", key);
            }
        }
        Ok(Self {
            key: key.to_string(),
            value,
            comment: comment.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &CardValue {
        &self.value
    }

    fn value_field(&self) -> String {
        match &self.value {
            CardValue::Str(s) => {
                let escaped = s.replace('\'', "''");
                // Strings are left-justified and padded to 8 chars inside
                // their quotes.
                format!("'{escaped:<8}'")
            }
            CardValue::Int(i) => format!("{i:>20}"),
            CardValue::Float(f) => {
                let mut s = format!("{f}");
                if !s.contains('.') && !s.contains('e') && !s.contains('E') {
                    s.push('.');
                }
                format!("{s:>20}")
            }
            CardValue::Bool(b) => format!("{:>20}", if *b { "T" } else { "F" }),
            CardValue::None => String::new(),
        }
    }

    /// Render the fixed 80-byte form.
    pub fn format(&self) -> ZTileResult<[u8; CARD_SIZE]> {
        let mut text = if matches!(self.value, CardValue::None) {
            if self.comment.is_empty() {
                format!("{:<8}", self.key)
            } else {
                format!("{:<8}{}", self.key, self.comment)
            }
        } else {
            let mut t = format!("{:<8}= {}", self.key, self.value_field());
            if !self.comment.is_empty() {
                t.push_str(" / ");
                t.push_str(&self.comment);
            }
            t
        };

        if text.len() > CARD_SIZE {
            // Try again without the comment before giving up.
            text = format!("{:<8}= {}", self.key, self.value_field());
            if text.len() > CARD_SIZE {
                ztile_bail!(
                    Configuration: "header entry for key '{}' exceeds 80 characters even without its comment", self.key
                );
            }
        }

        let mut out = [b' '; CARD_SIZE];
        out[..text.len()].copy_from_slice(text.as_bytes());
        Ok(out)
    }
}

/// The ordered card list of one header unit.
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.cards.iter().position(|c| c.key == key)
    }

    /// Insert or update a card in place; updating preserves card order so a
    /// finalized header can be rewritten over its placeholder bytes.
    pub fn set(&mut self, key: &str, value: CardValue, comment: &str) -> ZTileResult<()> {
        let card = Card::new(key, value, comment)?;
        match self.find(key) {
            Some(i) => self.cards[i] = card,
            None => self.cards.push(card),
        }
        Ok(())
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>, comment: &str) -> ZTileResult<()> {
        self.set(key, CardValue::Str(value.into()), comment)
    }

    pub fn set_int(&mut self, key: &str, value: i64, comment: &str) -> ZTileResult<()> {
        self.set(key, CardValue::Int(value), comment)
    }

    pub fn set_float(&mut self, key: &str, value: f64, comment: &str) -> ZTileResult<()> {
        self.set(key, CardValue::Float(value), comment)
    }

    pub fn set_bool(&mut self, key: &str, value: bool, comment: &str) -> ZTileResult<()> {
        self.set(key, CardValue::Bool(value), comment)
    }

    pub fn add_comment(&mut self, text: &str) -> ZTileResult<()> {
        self.cards.push(Card::new("COMMENT", CardValue::None, text)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&CardValue> {
        self.find(key).map(|i| &self.cards[i].value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            CardValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            CardValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            CardValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn num_cards(&self) -> usize {
        self.cards.len()
    }

    /// Serialize all cards plus the END card, blank-padded to a whole number
    /// of 2880-byte blocks.
    pub fn to_bytes(&self) -> ZTileResult<Vec<u8>> {
        let mut out = Vec::with_capacity((self.cards.len() + 1) * CARD_SIZE);
        for card in &self.cards {
            out.extend_from_slice(&card.format()?);
        }
        let mut end = [b' '; CARD_SIZE];
        end[..3].copy_from_slice(b"END");
        out.extend_from_slice(&end);

        let block = CARD_SIZE * CARDS_PER_BLOCK;
        let over = out.len() % block;
        if over != 0 {
            out.resize(out.len() + block - over, b' ');
        }
        Ok(out)
    }

    /// Number of bytes [`Header::to_bytes`] will produce.
    pub fn byte_size(&self) -> usize {
        let raw = (self.cards.len() + 1) * CARD_SIZE;
        raw.div_ceil(CARD_SIZE * CARDS_PER_BLOCK) * CARD_SIZE * CARDS_PER_BLOCK
    }

    /// Parse one header unit from `bytes`, consuming up to and including the
    /// block containing the END card. Returns the header and the number of
    /// bytes consumed.
    pub fn parse(bytes: &[u8]) -> ZTileResult<(Self, usize)> {
        let mut cards = Vec::new();
        let mut pos = 0;
        loop {
            if pos + CARD_SIZE > bytes.len() {
                ztile_bail!(InvalidSerde: "header ended without an END card after {} bytes", pos);
            }
            let raw = &bytes[pos..pos + CARD_SIZE];
            pos += CARD_SIZE;
            let text = std::str::from_utf8(raw)
                .map_err(|_| ztile_error::ztile_err!(InvalidSerde: "non-ASCII header card"))?;
            let key = text[..8].trim_end().to_string();
            if key == "END" {
                break;
            }
            if key.is_empty() && text.trim().is_empty() {
                continue;
            }
            let card = if &text[8..10] == "= " {
                let (value, comment) = parse_value(&text[10..]);
                Card {
                    key,
                    value,
                    comment,
                }
            } else {
                Card {
                    key,
                    value: CardValue::None,
                    comment: text[8..].trim_end().to_string(),
                }
            };
            cards.push(card);
        }
        // Consume the padding of the final block.
        let block = CARD_SIZE * CARDS_PER_BLOCK;
        let consumed = pos.div_ceil(block) * block;
        Ok((Self { cards }, consumed))
    }
}

fn parse_value(field: &str) -> (CardValue, String) {
    let trimmed = field.trim_start();
    if let Some(rest) = trimmed.strip_prefix('\'') {
        // Find the closing quote, skipping escaped '' pairs.
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    value.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        let tail: String = chars.collect();
        let comment = tail
            .trim_start()
            .strip_prefix('/')
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        (CardValue::Str(value.trim_end().to_string()), comment)
    } else {
        let (value_part, comment) = match trimmed.split_once('/') {
            Some((v, c)) => (v.trim(), c.trim().to_string()),
            None => (trimmed.trim(), String::new()),
        };
        let value = if value_part == "T" {
            CardValue::Bool(true)
        } else if value_part == "F" {
            CardValue::Bool(false)
        } else if let Ok(i) = value_part.parse::<i64>() {
            CardValue::Int(i)
        } else if let Ok(f) = value_part.parse::<f64>() {
            CardValue::Float(f)
        } else {
            CardValue::Str(value_part.to_string())
        };
        (value, comment)
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Header({} cards)", self.cards.len())
    }
}

#[cfg(test)]
mod test {
    use super::{CardValue, Header, CARD_SIZE};

    #[test]
    fn cards_are_eighty_bytes() {
        let mut header = Header::new();
        header.set_bool("SIMPLE", true, "file conforms to the standard").unwrap();
        header.set_int("BITPIX", 8, "").unwrap();
        header.set_str("EXTNAME", "DATA", "").unwrap();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), 2880);
        assert_eq!(&bytes[..6], b"SIMPLE");
        assert_eq!(bytes[CARD_SIZE * 3..CARD_SIZE * 3 + 3], *b"END");
    }

    #[test]
    fn header_round_trips() {
        let mut header = Header::new();
        header.set_bool("ZTABLE", true, "compressed table").unwrap();
        header.set_int("ZTILELEN", 100, "rows per tile").unwrap();
        header.set_str("PBFHEAD", "Event", "record type").unwrap();
        header.set_float("ZRATIO", 3.25, "").unwrap();
        header.set_str("TPBID1", "1.2.0", "").unwrap();
        header.add_comment("written by a test").unwrap();

        let bytes = header.to_bytes().unwrap();
        let (parsed, consumed) = Header::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.get_bool("ZTABLE"), Some(true));
        assert_eq!(parsed.get_int("ZTILELEN"), Some(100));
        assert_eq!(parsed.get_str("PBFHEAD"), Some("Event"));
        assert_eq!(parsed.get_str("TPBID1"), Some("1.2.0"));
        assert_eq!(parsed.get("ZRATIO"), Some(&CardValue::Float(3.25)));
    }

    #[test]
    fn update_preserves_order_and_size() {
        let mut header = Header::new();
        header.set_int("NAXIS2", 0, "placeholder").unwrap();
        header.set_str("CHECKSUM", "0000000000000000", "").unwrap();
        let before = header.byte_size();
        header.set_int("NAXIS2", 1381, "rows").unwrap();
        assert_eq!(header.byte_size(), before);
        assert_eq!(header.num_cards(), 2);
    }

    #[test]
    fn bad_keys_are_rejected() {
        let mut header = Header::new();
        assert!(header.set_int("TOOLONGKEY", 1, "").is_err());
        assert!(header.set_int("lower", 1, "").is_err());
    }

    #[test]
    fn quoted_strings_escape() {
        let mut header = Header::new();
        header.set_str("ORIGIN", "it's", "").unwrap();
        let bytes = header.to_bytes().unwrap();
        let (parsed, _) = Header::parse(&bytes).unwrap();
        assert_eq!(parsed.get_str("ORIGIN"), Some("it's"));
    }
}
