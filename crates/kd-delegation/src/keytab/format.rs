//! MIT keytab file format (version 0x0502)
//!
//! All integers are big-endian. The file is a two-byte version followed by
//! length-prefixed entries; a negative length marks a hole of that many bytes.
//!
//! ```text
//! entry := num_components:u16 realm:data component:data* name_type:u32
//!          timestamp:u32 kvno:u8 enctype:u16 key:data [kvno32:u32]
//! data  := len:u16 bytes[len]
//! ```

use std::fmt;

use bytes::{Buf, BufMut};

use crate::capability::CapabilityError;
use crate::principal::Principal;

const KEYTAB_MAGIC: u8 = 0x05;
const KEYTAB_VERSION: u8 = 0x02;

/// KRB5_NT_PRINCIPAL
const NT_PRINCIPAL: u32 = 1;

#[derive(Clone, PartialEq, Eq)]
pub struct KeytabEntry {
    /// `component[/component...]@REALM`
    pub principal: String,
    pub name_type: u32,
    pub timestamp: u32,
    pub kvno: u32,
    pub enctype: u16,
    pub key: Vec<u8>,
}

impl KeytabEntry {
    pub fn new(principal: impl Into<String>, kvno: u32, enctype: u16, key: Vec<u8>) -> Self {
        Self {
            principal: principal.into(),
            name_type: NT_PRINCIPAL,
            timestamp: 0,
            kvno,
            enctype,
            key,
        }
    }
}

impl fmt::Debug for KeytabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeytabEntry")
            .field("principal", &self.principal)
            .field("kvno", &self.kvno)
            .field("enctype", &self.enctype)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn malformed(reason: impl Into<String>) -> CapabilityError {
    CapabilityError::MalformedKeytab(reason.into())
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<(), CapabilityError> {
    if buf.remaining() < n {
        return Err(malformed(format!("truncated {}", what)));
    }
    Ok(())
}

fn read_data<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8], CapabilityError> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    let remaining: &'a [u8] = *buf;
    let (data, rest) = remaining.split_at(len);
    *buf = rest;
    Ok(data)
}

fn read_string(buf: &mut &[u8], what: &str) -> Result<String, CapabilityError> {
    let data = read_data(buf, what)?;
    String::from_utf8(data.to_vec()).map_err(|_| malformed(format!("{} is not UTF-8", what)))
}

fn parse_entry(mut buf: &[u8]) -> Result<KeytabEntry, CapabilityError> {
    need(&buf, 2, "component count")?;
    let num_components = buf.get_u16();
    let realm = read_string(&mut buf, "realm")?;

    let components = (0..num_components)
        .map(|_| read_string(&mut buf, "principal component"))
        .collect::<Result<Vec<_>, _>>()?;
    if components.is_empty() {
        return Err(malformed("entry has no principal components"));
    }

    need(&buf, 4 + 4 + 1 + 2, "entry header")?;
    let name_type = buf.get_u32();
    let timestamp = buf.get_u32();
    let kvno8 = buf.get_u8();
    let enctype = buf.get_u16();
    let key = read_data(&mut buf, "key")?.to_vec();

    // The 32-bit kvno supersedes the 8-bit one when present and non-zero.
    let kvno = if buf.remaining() >= 4 {
        match buf.get_u32() {
            0 => u32::from(kvno8),
            kvno32 => kvno32,
        }
    } else {
        u32::from(kvno8)
    };

    Ok(KeytabEntry {
        principal: format!("{}@{}", components.join("/"), realm),
        name_type,
        timestamp,
        kvno,
        enctype,
        key,
    })
}

/// Parse every live entry of a keytab.
pub fn parse_keytab(bytes: &[u8]) -> Result<Vec<KeytabEntry>, CapabilityError> {
    let mut buf = bytes;
    need(&buf, 2, "keytab version")?;
    let magic = buf.get_u8();
    let version = buf.get_u8();
    if magic != KEYTAB_MAGIC {
        return Err(malformed(format!("bad magic byte 0x{:02x}", magic)));
    }
    if version != KEYTAB_VERSION {
        return Err(malformed(format!("unsupported keytab version 0x{:02x}{:02x}", magic, version)));
    }

    let mut entries = Vec::new();
    while buf.remaining() >= 4 {
        let size = buf.get_i32();
        if size == 0 {
            break;
        }
        let len = size.unsigned_abs() as usize;
        need(&buf, len, "entry")?;
        let (record, rest) = buf.split_at(len);
        buf = rest;
        if size > 0 {
            entries.push(parse_entry(record)?);
        }
    }

    Ok(entries)
}

/// Serialize entries into a version 0x0502 keytab.
pub fn write_keytab(entries: &[KeytabEntry]) -> Result<Vec<u8>, CapabilityError> {
    let mut out = vec![KEYTAB_MAGIC, KEYTAB_VERSION];

    for entry in entries {
        let principal = Principal::parse(&entry.principal)
            .map_err(|e| malformed(e.to_string()))?;
        let realm = principal
            .realm()
            .ok_or_else(|| malformed(format!("{} has no realm", entry.principal)))?;
        let mut components = vec![principal.shortname()];
        if let Some(instance) = principal.instance() {
            components.extend(instance.split('/'));
        }

        let mut record = Vec::new();
        let count = u16::try_from(components.len())
            .map_err(|_| malformed(format!("{} has too many components", entry.principal)))?;
        record.put_u16(count);
        put_data(&mut record, realm.as_bytes())?;
        for component in &components {
            put_data(&mut record, component.as_bytes())?;
        }
        record.put_u32(entry.name_type);
        record.put_u32(entry.timestamp);
        record.put_u8(entry.kvno.min(u32::from(u8::MAX)) as u8);
        record.put_u16(entry.enctype);
        put_data(&mut record, &entry.key)?;
        record.put_u32(entry.kvno);

        let size = i32::try_from(record.len())
            .map_err(|_| malformed(format!("entry for {} is too large", entry.principal)))?;
        out.put_i32(size);
        out.extend_from_slice(&record);
    }

    Ok(out)
}

fn put_data(out: &mut Vec<u8>, data: &[u8]) -> Result<(), CapabilityError> {
    let len = u16::try_from(data.len())
        .map_err(|_| malformed(format!("field of {} bytes exceeds the keytab limit", data.len())))?;
    out.put_u16(len);
    out.extend_from_slice(data);
    Ok(())
}
