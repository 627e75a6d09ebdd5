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
        KEY_EXPRESSION_SIZE, MAX_NDX_PAGE_NO, NDX_PAGE_SIZE, PageNo,
        error::{Result, XbaseError},
        page::{IndexEntry, IndexPage},
    },
};

/// NDX header, page 0 of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct NdxHeader {
    pub root_page: PageNo,
    pub total_pages: u32,
    pub key_length: u16,
    pub keys_per_page: u16,
    pub key_type: u16,
    /// Child pointer + record number + key padded to 4 bytes.
    pub key_record_size: usize,
    pub unique: bool,
    pub key_expression: String,
}

impl NdxHeader {
    pub fn from_bytes(bytes: &[u8], stream_len: u64) -> Result<Self> {
        if stream_len < (NDX_PAGE_SIZE * 2) as u64 {
            return Err(XbaseError::format(format!(
                "NDX file length {} < {}",
                stream_len,
                NDX_PAGE_SIZE * 2
            )));
        }
        if stream_len % NDX_PAGE_SIZE as u64 != 0 {
            return Err(XbaseError::format(format!(
                "NDX file length {} is not a multiple of {}",
                stream_len, NDX_PAGE_SIZE
            )));
        }
        if bytes.len() < 24 + KEY_EXPRESSION_SIZE {
            return Err(XbaseError::format("NDX header too short"));
        }

        let mut cursor = Cursor::new(bytes);
        let root_page = cursor.read_i32::<LittleEndian>()?;
        let total_pages = cursor.read_i32::<LittleEndian>()?;
        let _reserved = cursor.read_i32::<LittleEndian>()?;
        let key_length = cursor.read_u16::<LittleEndian>()?;
        let keys_per_page = cursor.read_u16::<LittleEndian>()?;
        let key_type = cursor.read_u16::<LittleEndian>()?;
        // stored record size is unreliable, it is recomputed from the key length
        let _stored_record_size = cursor.read_i32::<LittleEndian>()?;
        let _reserved = cursor.read_u8()?;
        let unique = cursor.read_u8()? != 0;

        let key_expression = parse_key_expression(&bytes[24..24 + KEY_EXPRESSION_SIZE])
            .ok_or_else(|| XbaseError::format("NDX key expression is invalid"))?;

        let key_record_size = 8 + (key_length as usize).div_ceil(4) * 4;
        if key_length == 0 || 4 + key_record_size + 4 > NDX_PAGE_SIZE {
            return Err(XbaseError::format(format!("NDX key length {}", key_length)));
        }
        if root_page < 1 || root_page as u32 > MAX_NDX_PAGE_NO {
            return Err(XbaseError::format(format!("NDX root page {}", root_page)));
        }

        Ok(Self {
            root_page: root_page as PageNo,
            total_pages: total_pages.max(0) as u32,
            key_length,
            keys_per_page,
            key_type,
            key_record_size,
            unique,
            key_expression,
        })
    }

    /// Decode one 512-byte page. Interior pages carry one more child
    /// pointer after the last entry.
    pub fn parse_page(&self, bytes: &[u8], page_no: PageNo) -> Result<IndexPage> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_i32::<LittleEndian>()?;
        if count < 0 || 4 + count as usize * self.key_record_size > NDX_PAGE_SIZE {
            return Err(XbaseError::corruption(format!(
                "NDX page {} holds {} entries",
                page_no, count
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut key = vec![0u8; self.key_length as usize];
        let padding = self.key_record_size - 8 - key.len();
        for _ in 0..count {
            let child = cursor.read_i32::<LittleEndian>()?;
            let rec_no = cursor.read_i32::<LittleEndian>()?;
            cursor.read_exact(&mut key)?;
            cursor.seek(SeekFrom::Current(padding as i64))?;
            if child < 0 || rec_no < 0 {
                return Err(XbaseError::corruption(format!(
                    "NDX page {} has negative pointers",
                    page_no
                )));
            }
            entries.push(IndexEntry {
                child: child as PageNo,
                rec_no: rec_no as u32,
                key: key.clone(),
            });
        }

        let interior = entries.iter().any(|e| e.child > 0);
        let trailing_child = if interior {
            if cursor.position() as usize + 4 > NDX_PAGE_SIZE {
                return Err(XbaseError::corruption(format!(
                    "NDX page {} has no room for its last child",
                    page_no
                )));
            }
            cursor.read_i32::<LittleEndian>()?.max(0) as PageNo
        } else {
            0
        };

        Ok(IndexPage {
            entries,
            trailing_child,
        })
    }
}

#[derive(Debug)]
pub struct NdxIndex {
    file: File,
    header: NdxHeader,
}

impl NdxIndex {
    pub fn new(mut file: File) -> Result<Self> {
        let header = read_header(&mut file)?;
        debug!(
            "NDX index '{}' root={} key_length={}",
            header.key_expression, header.root_page, header.key_length
        );
        Ok(Self { file, header })
    }

    pub fn header(&self) -> &NdxHeader {
        &self.header
    }
}

fn read_header(file: &mut File) -> Result<NdxHeader> {
    let stream_len = file.seek(SeekFrom::End(0))?;
    let mut buffer = vec![0u8; NDX_PAGE_SIZE];
    file.seek(SeekFrom::Start(0))?;
    if stream_len >= NDX_PAGE_SIZE as u64 {
        file.read_exact(&mut buffer)?;
    }
    NdxHeader::from_bytes(&buffer, stream_len)
}

impl IndexFormat for NdxIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Ndx
    }

    fn key_expression(&self) -> &str {
        &self.header.key_expression
    }

    fn key_length(&self) -> usize {
        self.header.key_length as usize
    }

    fn is_unique(&self) -> bool {
        self.header.unique
    }

    fn root_page(&self) -> PageNo {
        self.header.root_page
    }

    fn read_page(&mut self, page_no: PageNo) -> Result<IndexPage> {
        let stream_len = self.file.seek(SeekFrom::End(0))?;
        let position = page_no as u64 * NDX_PAGE_SIZE as u64;
        if page_no < 1 || page_no > MAX_NDX_PAGE_NO || position + NDX_PAGE_SIZE as u64 > stream_len {
            return Err(XbaseError::range(
                "NDX page",
                page_no as i64,
                (stream_len / NDX_PAGE_SIZE as u64) as i64 - 1,
            ));
        }

        trace!("Reading NDX page {}", page_no);
        let mut buffer = vec![0u8; NDX_PAGE_SIZE];
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(&mut buffer)?;
        self.header.parse_page(&buffer, page_no)
    }

    fn revalidate(&mut self) -> Result<()> {
        self.header = read_header(&mut self.file)?;
        Ok(())
    }
}
