//! Tar header model for the pax-extended archive woven through the artifact.
//!
//! Headers are fixed 512-byte blocks with the ustar field layout. We only
//! ever read and write whole blocks; the escape layer decides where blocks
//! sit in the surrounding HTML. Numeric fields are NUL-terminated octal
//! ASCII, checksums are computed with the checksum field blanked to spaces.

use std::ffi::CStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// One tar block.
pub const BLOCK: usize = 512;

/// Field offset of the mode field; everything before it is the name.
pub const NAME_LEN: usize = 100;

/// Offset inside `prefix` where the real (decoded) payload size of an entry
/// is recorded as eleven octal digits. Chosen past every field a pax reader
/// interprets. File offset 452.
pub const REALSIZE_IN_PREFIX: usize = 107;

/// Typeflag for a pax extended header.
pub const TYPE_EXTENSION: u8 = b'x';

/// Typeflag repurposed for an external URL reference; `linkname` carries the
/// URL, the prefix realsize slot carries the expected byte length.
pub const TYPE_EXTERNAL: u8 = b'S';

#[derive(Debug, Error)]
pub enum TarError {
    #[error("tar numeric field holds non-octal data")]
    BadHeader,

    #[error("expected a tar header at a 512-aligned offset but the data is short")]
    TruncatedArchive,

    #[error("file names must be ASCII")]
    NameNotAscii,

    #[error("file names must not contain characters needing HTML attribute escapes")]
    NameNotAttributeSafe,
}

/// The 512-byte ustar header, field by field.
#[derive(Clone, Copy)]
pub struct TarHeader {
    pub name: [u8; 100],     /*   0 */
    pub mode: [u8; 8],       /* 100 */
    pub uid: [u8; 8],        /* 108 */
    pub gid: [u8; 8],        /* 116 */
    pub size: [u8; 12],      /* 124 */
    pub mtime: [u8; 12],     /* 136 */
    pub chksum: [u8; 8],     /* 148 */
    pub typeflag: u8,        /* 156 */
    pub linkname: [u8; 100], /* 157 */
    pub magic: [u8; 6],      /* 257 */
    pub version: [u8; 2],    /* 263 */
    pub uname: [u8; 32],     /* 265 */
    pub gname: [u8; 32],     /* 297 */
    pub devmajor: [u8; 8],   /* 329 */
    pub devminor: [u8; 8],   /* 337 */
    pub prefix: [u8; 155],   /* 345 */
    /* 500..512 is padding */
}

impl TarHeader {
    pub const EMPTY: Self = TarHeader {
        name: [0; 100],
        mode: [0; 8],
        uid: [0; 8],
        gid: [0; 8],
        size: [0; 12],
        mtime: [0; 12],
        chksum: [0; 8],
        typeflag: 0,
        linkname: [0; 100],
        magic: [0; 6],
        version: [0; 2],
        uname: [0; 32],
        gname: [0; 32],
        devmajor: [0; 8],
        devminor: [0; 8],
        prefix: [0; 155],
    };

    /// Serialize into one block.
    pub fn to_block(&self) -> [u8; BLOCK] {
        let mut block = [0u8; BLOCK];
        block[0..100].copy_from_slice(&self.name);
        block[100..108].copy_from_slice(&self.mode);
        block[108..116].copy_from_slice(&self.uid);
        block[116..124].copy_from_slice(&self.gid);
        block[124..136].copy_from_slice(&self.size);
        block[136..148].copy_from_slice(&self.mtime);
        block[148..156].copy_from_slice(&self.chksum);
        block[156] = self.typeflag;
        block[157..257].copy_from_slice(&self.linkname);
        block[257..263].copy_from_slice(&self.magic);
        block[263..265].copy_from_slice(&self.version);
        block[265..297].copy_from_slice(&self.uname);
        block[297..329].copy_from_slice(&self.gname);
        block[329..337].copy_from_slice(&self.devmajor);
        block[337..345].copy_from_slice(&self.devminor);
        block[345..500].copy_from_slice(&self.prefix);
        block
    }

    pub fn from_block(block: &[u8; BLOCK]) -> Self {
        let mut this = Self::EMPTY;
        this.name.copy_from_slice(&block[0..100]);
        this.mode.copy_from_slice(&block[100..108]);
        this.uid.copy_from_slice(&block[108..116]);
        this.gid.copy_from_slice(&block[116..124]);
        this.size.copy_from_slice(&block[124..136]);
        this.mtime.copy_from_slice(&block[136..148]);
        this.chksum.copy_from_slice(&block[148..156]);
        this.typeflag = block[156];
        this.linkname.copy_from_slice(&block[157..257]);
        this.magic.copy_from_slice(&block[257..263]);
        this.version.copy_from_slice(&block[263..265]);
        this.uname.copy_from_slice(&block[265..297]);
        this.gname.copy_from_slice(&block[297..329]);
        this.devmajor.copy_from_slice(&block[329..337]);
        this.devminor.copy_from_slice(&block[337..345]);
        this.prefix.copy_from_slice(&block[345..500]);
        this
    }

    /// Parse a header at a 512-aligned offset of `data`.
    pub fn read_at(data: &[u8], offset: usize) -> Result<Self, TarError> {
        debug_assert_eq!(offset % BLOCK, 0);
        let block: &[u8; BLOCK] = data
            .get(offset..offset + BLOCK)
            .and_then(|b| b.try_into().ok())
            .ok_or(TarError::TruncatedArchive)?;
        Ok(Self::from_block(block))
    }

    pub fn is_zero(&self) -> bool {
        self.to_block().iter().all(|&b| b == 0)
    }

    /// Fixed metadata every header we emit carries: world-readable mode, the
    /// `nobody` uid/gid pair, ustar magic, a constant default mtime.
    pub fn apply_encoding_defaults(&mut self) {
        self.mode.copy_from_slice(b"0000644\0");
        // 65534 (nobody) in octal.
        self.uid.copy_from_slice(b"0177776\0");
        self.gid.copy_from_slice(b"0177776\0");
        self.mtime.copy_from_slice(b"14700000000\0");
        self.magic = *b"ustar\0";
        self.version = *b"  ";
        self.uname[..7].copy_from_slice(b"nobody\0");
        self.gname[..7].copy_from_slice(b"nobody\0");
    }

    pub fn set_size(&mut self, size: usize) {
        // Numeric, so it can never contain a closing quote.
        let text = format!("{size:011o}\0");
        self.size.copy_from_slice(text.as_bytes());
    }

    pub fn parse_size(&self) -> Result<u64, TarError> {
        parse_octal(&self.size)
    }

    /// Record the decoded payload length in the prefix slot.
    pub fn set_realsize(&mut self, realsize: u64) {
        let text = format!("{realsize:011o}");
        self.prefix[REALSIZE_IN_PREFIX..][..11].copy_from_slice(text.as_bytes());
    }

    pub fn parse_realsize(&self) -> Result<u64, TarError> {
        parse_octal(&self.prefix[REALSIZE_IN_PREFIX..][..11])
    }

    /// Checksum over the block with the checksum field counted as spaces.
    pub fn apply_checksum(&mut self) {
        self.chksum = *b"        ";
        let sum: u32 = self.to_block().iter().map(|&b| u32::from(b)).sum();
        let text = format!("{sum:06o}\0 ");
        self.chksum.copy_from_slice(text.as_bytes());
    }

    pub fn name_str(&self) -> Result<&str, TarError> {
        cstr_field(&self.name).ok_or(TarError::BadHeader)
    }

    pub fn apply_attributes(&mut self, attrs: &EntryAttributes<'_>) {
        if let Some(mtime) = attrs.mtime {
            let secs = mtime
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let text = format!("{secs:011o}\0");
            self.mtime.copy_from_slice(text.as_bytes());
        }

        if let Some(AttributeSafeName(uname)) = attrs.uname {
            let bytes = uname.as_bytes();
            assert!(bytes.len() < self.uname.len() - 1);
            self.uname[..bytes.len()].copy_from_slice(bytes);
            self.uname[bytes.len()] = 0;
        }

        if let Some(AttributeSafeName(gname)) = attrs.gname {
            let bytes = gname.as_bytes();
            assert!(bytes.len() < self.gname.len() - 1);
            self.gname[..bytes.len()].copy_from_slice(bytes);
            self.gname[bytes.len()] = 0;
        }

        let devmajor = format!("{:o}\0", attrs.devmajor);
        self.devmajor[..devmajor.len()].copy_from_slice(devmajor.as_bytes());
        let devminor = format!("{:o}\0", attrs.devminor);
        self.devminor[..devminor.len()].copy_from_slice(devminor.as_bytes());
    }
}

impl core::fmt::Debug for TarHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TarHeader")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("size", &String::from_utf8_lossy(&self.size))
            .field("typeflag", &(self.typeflag as char))
            .finish_non_exhaustive()
    }
}

fn parse_octal(field: &[u8]) -> Result<u64, TarError> {
    if field.first() == Some(&0) {
        return Ok(0);
    }

    let text = cstr_field(field).ok_or(TarError::BadHeader)?;
    u64::from_str_radix(text.trim(), 8).map_err(|_| TarError::BadHeader)
}

fn cstr_field(field: &[u8]) -> Option<&str> {
    // Fields without a terminating NUL use their full width.
    match CStr::from_bytes_until_nul(field) {
        Ok(cstr) => cstr.to_str().ok(),
        Err(_) => core::str::from_utf8(field).ok(),
    }
}

/// A name that can appear verbatim inside a double-quoted HTML attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttributeSafeName<'a>(pub &'a str);

impl<'a> AttributeSafeName<'a> {
    pub fn new(name: &'a str) -> Result<Self, TarError> {
        if !name.is_ascii() {
            return Err(TarError::NameNotAscii);
        }

        if name.bytes().any(|b| b == b'"' || b == b'<' || b == b'>') {
            return Err(TarError::NameNotAttributeSafe);
        }

        Ok(AttributeSafeName(name))
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

/// Per-entry metadata surviving the pack/unpack round-trip.
#[derive(Clone, Copy)]
pub struct EntryAttributes<'a> {
    pub mtime: Option<SystemTime>,
    pub uname: Option<AttributeSafeName<'a>>,
    pub gname: Option<AttributeSafeName<'a>>,
    pub devmajor: u16,
    pub devminor: u16,
}

impl<'a> EntryAttributes<'a> {
    pub fn from_header(header: &'a TarHeader) -> Self {
        let mtime = cstr_field(&header.mtime)
            .and_then(|text| u64::from_str_radix(text, 8).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        let uname = cstr_field(&header.uname).map(AttributeSafeName);
        let gname = cstr_field(&header.gname).map(AttributeSafeName);

        let devmajor = cstr_field(&header.devmajor)
            .and_then(|text| u16::from_str_radix(text, 8).ok())
            .unwrap_or(0);
        let devminor = cstr_field(&header.devminor)
            .and_then(|text| u16::from_str_radix(text, 8).ok())
            .unwrap_or(0);

        EntryAttributes {
            mtime,
            uname,
            gname,
            devmajor,
            devminor,
        }
    }
}

impl Default for EntryAttributes<'_> {
    fn default() -> Self {
        Self {
            mtime: None,
            uname: None,
            gname: None,
            devmajor: 0,
            devminor: 0,
        }
    }
}

/// Round up to the next block boundary.
pub fn align(offset: u64) -> u64 {
    offset.next_multiple_of(BLOCK as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_roundtrip() {
        let mut header = TarHeader::EMPTY;
        header.name[..5].copy_from_slice(b"a/b/c");
        header.typeflag = TYPE_EXTENSION;
        header.apply_encoding_defaults();
        header.set_size(0o1234);
        header.apply_checksum();

        let block = header.to_block();
        let back = TarHeader::from_block(&block);
        assert_eq!(back.to_block(), block);
        assert_eq!(back.parse_size().unwrap(), 0o1234);
        assert_eq!(back.name_str().unwrap(), "a/b/c");
    }

    #[test]
    fn attributes_roundtrip() {
        let attrs = EntryAttributes {
            mtime: Some(UNIX_EPOCH + Duration::from_secs(1234)),
            uname: Some(AttributeSafeName("alice")),
            gname: Some(AttributeSafeName("bob")),
            devmajor: 42,
            devminor: 24,
        };

        let mut header = TarHeader::EMPTY;
        header.apply_attributes(&attrs);
        header.apply_checksum();

        let after = EntryAttributes::from_header(&header);
        assert_eq!(after.mtime, attrs.mtime);
        assert_eq!(after.uname, attrs.uname);
        assert_eq!(after.gname, attrs.gname);
        assert_eq!(after.devmajor, attrs.devmajor);
        assert_eq!(after.devminor, attrs.devminor);
    }

    #[test]
    fn non_octal_size_is_rejected() {
        let mut header = TarHeader::EMPTY;
        header.size.copy_from_slice(b"0000deadbee\0");
        assert!(matches!(header.parse_size(), Err(TarError::BadHeader)));
    }

    #[test]
    fn realsize_slot() {
        let mut header = TarHeader::EMPTY;
        header.set_realsize(16);
        assert_eq!(header.parse_realsize().unwrap(), 16);
    }

    #[test]
    fn attribute_safe_name_rules() {
        assert!(AttributeSafeName::new("boot/init").is_ok());
        assert!(AttributeSafeName::new("a\"b").is_err());
        assert!(AttributeSafeName::new("日本語").is_err());
    }

    #[test]
    fn truncated_block() {
        let data = [0u8; 100];
        assert!(matches!(
            TarHeader::read_at(&data, 0),
            Err(TarError::TruncatedArchive)
        ));
    }
}
