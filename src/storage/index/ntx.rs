use std::{
    fs::File,
    io::{Cursor, Read, Seek, SeekFrom},
};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace};

use crate::{
    storage::{
        index::{IndexFormat, parse_key_expression},
        options::IndexType,
    },
    types::{
        KEY_EXPRESSION_SIZE, NTX_PAGE_SIZE, PageNo,
        error::{Result, XbaseError},
        page::{IndexEntry, IndexPage},
    },
};

pub const VALID_SIGNATURES: [u8; 5] = [0x03, 0x06, 0x07, 0x26, 0x27];
pub const MAX_KEY_SIZE: u16 = 250;
const KEY_EXPRESSION_OFFSET: usize = 22;
const UNIQUE_OFFSET: usize = KEY_EXPRESSION_OFFSET + KEY_EXPRESSION_SIZE;

/// NTX header. Page pointers in NTX files are byte offsets, used here as
/// page numbers directly.
#[derive(Debug, Clone, PartialEq)]
pub struct NtxHeader {
    pub signature: u8,
    pub version: u16,
    pub root: PageNo,
    pub unused: u32,
    pub item_size: u16,
    pub key_size: u16,
    pub key_decimals: u16,
    pub max_items: u16,
    /// Minimum occupancy of a non-root page.
    pub half_page: u16,
    pub key_expression: String,
    pub unique: bool,
}

impl NtxHeader {
    pub fn from_bytes(bytes: &[u8], stream_len: u64) -> Result<Self> {
        if stream_len < (NTX_PAGE_SIZE * 2) as u64 {
            return Err(XbaseError::format(format!(
                "NTX file length {} < {}",
                stream_len,
                NTX_PAGE_SIZE * 2
            )));
        }
        if stream_len % NTX_PAGE_SIZE as u64 != 0 {
            return Err(XbaseError::format(format!(
                "NTX file length {} is not a multiple of {}",
                stream_len, NTX_PAGE_SIZE
            )));
        }
        if bytes.len() <= UNIQUE_OFFSET {
            return Err(XbaseError::format("NTX header too short"));
        }

        if !VALID_SIGNATURES.contains(&bytes[0]) || bytes[1] != 0 {
            return Err(XbaseError::format(format!(
                "NTX signature {:02X} {:02X}",
                bytes[0], bytes[1]
            )));
        }

        let mut cursor = Cursor::new(bytes);
        cursor.set_position(2);
        let version = cursor.read_u16::<LittleEndian>()?;
        let root = cursor.read_u32::<LittleEndian>()?;
        let unused = cursor.read_u32::<LittleEndian>()?;
        let item_size = cursor.read_u16::<LittleEndian>()?;
        let key_size = cursor.read_u16::<LittleEndian>()?;
        let key_decimals = cursor.read_u16::<LittleEndian>()?;
        let max_items = cursor.read_u16::<LittleEndian>()?;
        let half_page = cursor.read_u16::<LittleEndian>()?;

        if key_size < 1 || key_size > MAX_KEY_SIZE {
            return Err(XbaseError::format(format!("NTX key size {}", key_size)));
        }
        if key_size + 8 != item_size {
            return Err(XbaseError::format(format!(
                "NTX item size {} for key size {}",
                item_size, key_size
            )));
        }

        let key_expression = parse_key_expression(
            &bytes[KEY_EXPRESSION_OFFSET..KEY_EXPRESSION_OFFSET + KEY_EXPRESSION_SIZE],
        )
        .ok_or_else(|| XbaseError::format("NTX key expression is invalid"))?;

        let unique = match bytes[UNIQUE_OFFSET] {
            0 => false,
            1 => true,
            other => {
                return Err(XbaseError::format(format!("NTX unique flag {}", other)));
            }
        };

        if root == 0 || root as usize % NTX_PAGE_SIZE != 0 || root as u64 + NTX_PAGE_SIZE as u64 > stream_len {
            return Err(XbaseError::format(format!("NTX root offset {}", root)));
        }

        Ok(Self {
            signature: bytes[0],
            version,
            root,
            unused,
            item_size,
            key_size,
            key_decimals,
            max_items,
            half_page,
            key_expression,
            unique,
        })
    }

    /// Decode one 1024-byte page: entry count, offset table, then items of
    /// child offset, record number and key. The item after the last entry
    /// only holds a child offset.
    pub fn parse_page(&self, bytes: &[u8], page_no: PageNo) -> Result<IndexPage> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u16::<LittleEndian>()? as usize;
        if count > self.max_items as usize || 2 + (count + 1) * 2 > NTX_PAGE_SIZE {
            return Err(XbaseError::corruption(format!(
                "NTX page {} holds {} entries (max {})",
                page_no, count, self.max_items
            )));
        }

        let mut offsets = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            offsets.push(cursor.read_u16::<LittleEndian>()? as usize);
        }

        let item_size = self.item_size as usize;
        let mut entries = Vec::with_capacity(count);
        for (i, &offset) in offsets.iter().enumerate() {
            let needed = if i < count { item_size } else { 4 };
            if offset + needed > NTX_PAGE_SIZE {
                return Err(XbaseError::corruption(format!(
                    "NTX page {} item {} at offset {} runs past the page",
                    page_no, i, offset
                )));
            }

            cursor.set_position(offset as u64);
            let child = cursor.read_u32::<LittleEndian>()?;
            if child as usize % NTX_PAGE_SIZE != 0 {
                return Err(XbaseError::corruption(format!(
                    "NTX page {} item {} child offset {}",
                    page_no, i, child
                )));
            }

            if i == count {
                return Ok(IndexPage {
                    entries,
                    trailing_child: child,
                });
            }

            let rec_no = cursor.read_u32::<LittleEndian>()?;
            let mut key = vec![0u8; self.key_size as usize];
            cursor.read_exact(&mut key)?;
            entries.push(IndexEntry { child, rec_no, key });
        }

        Ok(IndexPage {
            entries,
            trailing_child: 0,
        })
    }
}

#[derive(Debug)]
pub struct NtxIndex {
    file: File,
    header: NtxHeader,
}

impl NtxIndex {
    pub fn new(mut file: File) -> Result<Self> {
        let header = read_header(&mut file)?;
        debug!(
            "NTX index '{}' root={} key_size={} max_items={}",
            header.key_expression, header.root, header.key_size, header.max_items
        );
        Ok(Self { file, header })
    }

    pub fn header(&self) -> &NtxHeader {
        &self.header
    }
}

fn read_header(file: &mut File) -> Result<NtxHeader> {
    let stream_len = file.seek(SeekFrom::End(0))?;
    let mut buffer = vec![0u8; NTX_PAGE_SIZE];
    file.seek(SeekFrom::Start(0))?;
    if stream_len >= NTX_PAGE_SIZE as u64 {
        file.read_exact(&mut buffer)?;
    }
    NtxHeader::from_bytes(&buffer, stream_len)
}

impl IndexFormat for NtxIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Ntx
    }

    fn key_expression(&self) -> &str {
        &self.header.key_expression
    }

    fn key_length(&self) -> usize {
        self.header.key_size as usize
    }

    fn is_unique(&self) -> bool {
        self.header.unique
    }

    fn root_page(&self) -> PageNo {
        self.header.root
    }

    fn read_page(&mut self, page_no: PageNo) -> Result<IndexPage> {
        let stream_len = self.file.seek(SeekFrom::End(0))?;
        let position = page_no as u64;
        if page_no == 0
            || position % NTX_PAGE_SIZE as u64 != 0
            || position + NTX_PAGE_SIZE as u64 > stream_len
        {
            return Err(XbaseError::range(
                "NTX page offset",
                page_no as i64,
                stream_len as i64 - NTX_PAGE_SIZE as i64,
            ));
        }

        trace!("Reading NTX page at {}", page_no);
        let mut buffer = vec![0u8; NTX_PAGE_SIZE];
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(&mut buffer)?;
        self.header.parse_page(&buffer, page_no)
    }

    fn revalidate(&mut self) -> Result<()> {
        self.header = read_header(&mut self.file)?;
        Ok(())
    }
}
