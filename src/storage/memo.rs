//! Block-addressed memo (blob) files.
//!
//! The older layout (v3) has fixed 512-byte blocks and ends each blob with a
//! terminator byte. The newer one (v4) declares its block size in the header
//! and prefixes each blob with a signature and a length.

use std::{
    fs::{File, OpenOptions},
    io::{Cursor, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, trace, warn};

use crate::{
    storage::options::{MemoTerminators, MemoType, Strictness, TableOptions},
    types::{
        BlockNo, DBT3_BLOCK_SIZE, DBT4_BLOCK_SIGNATURE, DBT4_MAX_BLOCK_SIZE, DBT4_MIN_BLOCK_SIZE,
        EOF_MARKER, MEMO_BLOCK_SIZE_OFFSET, MEMO_FILENAME_OFFSET, MEMO_VERSION_OFFSET,
        error::{Result, XbaseError},
    },
};

const HEADER_READ_SIZE: usize = 24;

#[derive(Debug)]
pub struct MemoStore {
    /// `None` once the owning table has closed the store.
    file: Mutex<Option<File>>,
    memo_type: MemoType,
    block_size: usize,
    terminators: MemoTerminators,
    max_blob_size: usize,
}

/// Raw header fields shared by both layouts.
#[derive(Debug, Clone, Copy)]
struct MemoHeader {
    next_free: i32,
    version: u8,
    block_size: i16,
}

impl MemoHeader {
    fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut buffer = [0u8; HEADER_READ_SIZE];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut buffer)?;

        let mut cursor = Cursor::new(&buffer[..]);
        let next_free = cursor.read_i32::<LittleEndian>()?;
        cursor.set_position(MEMO_VERSION_OFFSET as u64);
        let version = cursor.read_u8()?;
        cursor.set_position(MEMO_BLOCK_SIZE_OFFSET as u64);
        let block_size = cursor.read_i16::<LittleEndian>()?;

        Ok(Self {
            next_free,
            version,
            block_size,
        })
    }
}

impl MemoStore {
    pub fn open<P: AsRef<Path>>(path: P, memo_type: MemoType, options: &TableOptions) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening memo file {}", path.display());
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(file, memo_type, options)
    }

    pub fn from_file(mut file: File, memo_type: MemoType, options: &TableOptions) -> Result<Self> {
        let memo_type = match memo_type {
            MemoType::Undefined => detect_memo_type(&mut file)?,
            known => known,
        };

        let stream_len = file.seek(SeekFrom::End(0))?;
        let min_len = match memo_type {
            MemoType::Dbt4 => DBT4_MIN_BLOCK_SIZE,
            _ => DBT3_BLOCK_SIZE,
        } as u64;
        if stream_len < min_len {
            return Err(XbaseError::format(format!(
                "memo file too short ({} < {})",
                stream_len, min_len
            )));
        }

        let header = MemoHeader::read_from(&mut file)?;
        let strictness = options.strictness;

        let block_size = match memo_type {
            MemoType::Dbt4 => {
                if header.version != 0x00 && strictness >= Strictness::Weak {
                    return Err(XbaseError::format(format!(
                        "v4 memo version byte 0x{:02X}",
                        header.version
                    )));
                }
                let block_size = header.block_size as i64;
                if !is_valid_v4_block_size(block_size) {
                    return Err(XbaseError::format(format!(
                        "v4 memo block size {}",
                        block_size
                    )));
                }
                let block_size = block_size as usize;
                if strictness >= Strictness::Medium && !check_block_multiple(&mut file, block_size)? {
                    return Err(XbaseError::format(format!(
                        "memo file length {} is not a multiple of {}",
                        stream_len, block_size
                    )));
                }
                block_size
            }
            _ => {
                if header.version != 0x03 {
                    if strictness > Strictness::Medium {
                        return Err(XbaseError::format(format!(
                            "v3 memo version byte 0x{:02X}",
                            header.version
                        )));
                    }
                    warn!("Tolerating v3 memo version byte 0x{:02X}", header.version);
                }
                if header.block_size as usize != DBT3_BLOCK_SIZE {
                    if strictness > Strictness::Medium {
                        return Err(XbaseError::format(format!(
                            "v3 memo block size {}",
                            header.block_size
                        )));
                    }
                    debug!("Forcing v3 memo block size 512 (header says {})", header.block_size);
                }
                if strictness >= Strictness::Weak && !check_block_multiple(&mut file, DBT3_BLOCK_SIZE)? {
                    return Err(XbaseError::format(format!(
                        "memo file length {} is not a multiple of {}",
                        stream_len, DBT3_BLOCK_SIZE
                    )));
                }
                DBT3_BLOCK_SIZE
            }
        };

        if strictness >= Strictness::Potent && !check_next_free(&mut file, header.next_free, block_size)? {
            return Err(XbaseError::format(format!(
                "next free block {} disagrees with memo file length {}",
                header.next_free, stream_len
            )));
        }

        debug!("Memo store {:?} with block size {}", memo_type, block_size);
        Ok(Self {
            file: Mutex::new(Some(file)),
            memo_type,
            block_size,
            terminators: options.memo_terminators,
            max_blob_size: options.max_blob_size,
        })
    }

    /// Write an empty memo file holding only the header block.
    pub fn create<P: AsRef<Path>>(path: P, memo_type: MemoType, block_size: usize) -> Result<File> {
        let path = path.as_ref();
        match memo_type {
            MemoType::Dbt3 if block_size != DBT3_BLOCK_SIZE => {
                return Err(XbaseError::format(format!("v3 memo block size must be 512, got {}", block_size)));
            }
            MemoType::Dbt4 if !is_valid_v4_block_size(block_size as i64) => {
                return Err(XbaseError::format(format!(
                    "v4 memo block size must be a multiple of 64 in 64..=32768, got {}",
                    block_size
                )));
            }
            MemoType::Undefined => {
                return Err(XbaseError::configuration("memo type must be known to create a memo file"));
            }
            _ => {}
        }

        let mut header = vec![0u8; block_size];
        header[0..4].copy_from_slice(&1i32.to_le_bytes());
        match memo_type {
            MemoType::Dbt4 => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let stem = stem.as_bytes();
                let len = stem.len().min(8);
                header[MEMO_FILENAME_OFFSET..MEMO_FILENAME_OFFSET + len].copy_from_slice(&stem[..len]);
                header[MEMO_VERSION_OFFSET] = 0x00;
            }
            _ => header[MEMO_VERSION_OFFSET] = 0x03,
        }
        header[MEMO_BLOCK_SIZE_OFFSET..MEMO_BLOCK_SIZE_OFFSET + 2]
            .copy_from_slice(&(block_size as i16).to_le_bytes());

        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all(&header)?;
        file.flush()?;
        info!("Created {:?} memo file {}", memo_type, path.display());
        Ok(file)
    }

    pub fn memo_type(&self) -> MemoType {
        self.memo_type
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Read the blob starting at `block`. Safe to call from several threads.
    pub fn read(&self, block: BlockNo) -> Result<Vec<u8>> {
        if block < 1 {
            return Err(XbaseError::range("memo block", block as i64, i64::MAX));
        }

        let mut guard = self.file.lock().map_err(|_| XbaseError::LockPoisoned)?;
        let file = guard
            .as_mut()
            .ok_or_else(|| XbaseError::state("memo store is closed"))?;
        let stream_len = file.seek(SeekFrom::End(0))?;
        let position = block as u64 * self.block_size as u64;
        if position >= stream_len {
            return Err(XbaseError::range(
                "memo block",
                block as i64,
                (stream_len / self.block_size as u64) as i64 - 1,
            ));
        }

        trace!("Reading memo block {} at {}", block, position);
        file.seek(SeekFrom::Start(position))?;
        match self.memo_type {
            MemoType::Dbt4 => self.read_v4(file, block),
            _ => self.read_v3(file, block, stream_len - position),
        }
    }

    /// Release the memo file. Later reads fail with a state error.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().map_err(|_| XbaseError::LockPoisoned)?;
        if guard.take().is_some() {
            debug!("Closed memo store");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }

    fn read_v4(&self, file: &mut File, block: BlockNo) -> Result<Vec<u8>> {
        let mut signature = [0u8; 4];
        file.read_exact(&mut signature)?;
        if signature != DBT4_BLOCK_SIGNATURE {
            return Err(XbaseError::format(format!(
                "memo block {} lacks the v4 signature (found {:02X?})",
                block, signature
            )));
        }

        let len = file.read_i32::<LittleEndian>()?;
        if len < 1 || len as usize > self.max_blob_size {
            return Err(XbaseError::format(format!(
                "memo block {} declares length {} outside 1..={}",
                block, len, self.max_blob_size
            )));
        }

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => XbaseError::corruption(format!(
                "memo block {} shorter than its declared length {}",
                block, len
            )),
            _ => XbaseError::Io(e),
        })?;
        Ok(data)
    }

    fn read_v3(&self, file: &mut File, block: BlockNo, available: u64) -> Result<Vec<u8>> {
        let limit = (self.max_blob_size as u64).min(available) as usize;
        let mut data = Vec::with_capacity(limit.min(16 * 1024));

        while data.len() < limit {
            let start = data.len();
            let chunk = self.block_size.min(limit - start);
            data.resize(start + chunk, 0);
            file.read_exact(&mut data[start..])?;

            if let Some(end) = data[start..].iter().position(|&b| self.terminators.matches(b)) {
                data.truncate(start + end);
                return Ok(data);
            }
        }

        if limit == self.max_blob_size {
            warn!("Memo block {} truncated at {} bytes", block, limit);
        }
        Ok(data)
    }
}

pub fn is_valid_v4_block_size(block_size: i64) -> bool {
    (DBT4_MIN_BLOCK_SIZE as i64..=DBT4_MAX_BLOCK_SIZE as i64).contains(&block_size)
        && block_size % DBT4_MIN_BLOCK_SIZE as i64 == 0
}

/// File length is a whole number of blocks, optionally followed by an EOF marker.
fn check_block_multiple<R: Read + Seek>(reader: &mut R, block_size: usize) -> Result<bool> {
    if block_size < DBT4_MIN_BLOCK_SIZE || block_size % DBT4_MIN_BLOCK_SIZE != 0 {
        return Ok(false);
    }
    let stream_len = reader.seek(SeekFrom::End(0))?;
    if stream_len < block_size as u64 {
        return Ok(false);
    }
    match stream_len % block_size as u64 {
        0 => Ok(true),
        1 => last_byte_is(reader, stream_len, EOF_MARKER),
        _ => Ok(false),
    }
}

fn check_next_free<R: Read + Seek>(reader: &mut R, next_free: i32, block_size: usize) -> Result<bool> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    let expected = next_free as i64 * block_size as i64;
    if stream_len as i64 == expected + 1 {
        return last_byte_is(reader, stream_len, EOF_MARKER);
    }
    Ok(stream_len as i64 == expected)
}

fn last_byte_is<R: Read + Seek>(reader: &mut R, stream_len: u64, marker: u8) -> Result<bool> {
    reader.seek(SeekFrom::Start(stream_len - 1))?;
    Ok(reader.read_u8()? == marker)
}

/// Position of the first block carrying the v4 signature, if any.
fn find_v4_block<R: Read + Seek>(reader: &mut R, block_size: usize) -> Result<Option<u64>> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    let mut starts = vec![DBT3_BLOCK_SIZE as u64];
    if block_size % 1024 == 0 {
        starts.insert(0, block_size as u64);
    }

    let mut signature = [0u8; 4];
    for start in starts {
        let mut position = start;
        while position + 8 < stream_len {
            reader.seek(SeekFrom::Start(position))?;
            reader.read_exact(&mut signature)?;
            if signature == DBT4_BLOCK_SIGNATURE {
                return Ok(Some(position));
            }
            position += block_size as u64;
        }
    }
    Ok(None)
}

/// Guess the memo layout from header values and block signatures.
pub fn detect_memo_type<R: Read + Seek>(reader: &mut R) -> Result<MemoType> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    if stream_len < DBT4_MIN_BLOCK_SIZE as u64 {
        return Err(XbaseError::format(format!(
            "memo file too short ({} < {})",
            stream_len, DBT4_MIN_BLOCK_SIZE
        )));
    }

    let header = MemoHeader::read_from(reader)?;
    let block_size = header.block_size as i64;
    if block_size <= 0 || block_size % DBT4_MIN_BLOCK_SIZE as i64 != 0 {
        return Err(XbaseError::format(format!(
            "memo block size {} is not a multiple of 64",
            block_size
        )));
    }
    let block_size = block_size as usize;
    if !check_block_multiple(reader, block_size)? {
        return Err(XbaseError::format(format!(
            "memo file length {} is not a multiple of {}",
            stream_len, block_size
        )));
    }

    if header.version == 0x03 && block_size == DBT3_BLOCK_SIZE {
        return Ok(MemoType::Dbt3);
    }
    if block_size != DBT3_BLOCK_SIZE {
        return Ok(MemoType::Dbt4);
    }
    if header.version == 0x00 || find_v4_block(reader, block_size)?.is_some() {
        return Ok(MemoType::Dbt4);
    }
    Ok(MemoType::Dbt3)
}
