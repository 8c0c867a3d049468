use super::error::BencodeError;
use super::value::{Dict, Value};
use bytes::Bytes;

const MAX_DEPTH: usize = 64;

/// Decodes exactly one value; any bytes left over are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;

    let rest = data.len() - decoder.pos;
    if rest != 0 {
        return Err(BencodeError::TrailingData(rest));
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    /// Consumes bytes up to (not including) `stop` and skips the stop byte.
    fn take_until(&mut self, stop: u8) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == stop)
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        self.pos = start + len + 1;
        Ok(&self.data[start..start + len])
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        let offset = self.pos;
        self.pos += 1;
        let digits = self.take_until(b'e')?;

        let valid = match digits {
            [] | [b'-'] => false,
            [b'-', b'0', ..] => false,
            [b'0', _, ..] => false,
            _ => true,
        };
        if !valid {
            return Err(BencodeError::InvalidInteger(offset));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::Integer)
            .ok_or(BencodeError::InvalidInteger(offset))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let offset = self.pos;
        let len_digits = self.take_until(b':')?;

        if len_digits.len() > 1 && len_digits[0] == b'0' {
            return Err(BencodeError::InvalidLength(offset));
        }
        let len: usize = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength(offset))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = Dict::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey(self.pos));
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
