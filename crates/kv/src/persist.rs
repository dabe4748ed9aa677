//! Sequence save/restore file format
//!
//! Used by the head's `slot_save`/`slot_restore` tasks. Layout (little-endian):
//! - 4 bytes: magic `RLKV`
//! - 4 bytes: version (u32)
//! - 4 bytes: crc32 of everything after this field
//! - 4 bytes: n_layers (u32)
//! - 4 bytes: kv_dim (u32)
//! - per layer: n_cells (u32), then cells as (pos i32, k, v) with rows of
//!   `kv_dim` f16 values

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use crate::cache::{Cell, KvCache};
use crate::error::{KvError, Result};
use crate::mutation::KvMutation;

const SEQ_FILE_MAGIC: &[u8; 4] = b"RLKV";
const SEQ_FILE_VERSION: u32 = 1;

impl KvCache {
    /// Write one sequence's cells (all local layers) to `path`.
    /// Returns the number of cells written at layer 0.
    pub fn seq_save(&self, seq: u32, path: impl AsRef<Path>) -> Result<usize> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(self.n_layers() as u32)?;
        body.write_u32::<LittleEndian>(self.kv_dim() as u32)?;

        for layer in 0..self.n_layers() {
            let cells = self.cells(layer, seq);
            body.write_u32::<LittleEndian>(cells.len() as u32)?;
            for cell in cells {
                body.write_i32::<LittleEndian>(cell.pos)?;
                for x in &cell.k {
                    body.write_u16::<LittleEndian>(x.to_bits())?;
                }
                for x in &cell.v {
                    body.write_u16::<LittleEndian>(x.to_bits())?;
                }
            }
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(SEQ_FILE_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEQ_FILE_VERSION)?;
        writer.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        writer.write_all(&body)?;
        writer.flush()?;

        Ok(self.seq_len(seq))
    }

    /// Replace one sequence's cells from a file written by `seq_save`.
    /// Returns the number of cells restored at layer 0.
    pub fn seq_restore(&mut self, seq: u32, path: impl AsRef<Path>) -> Result<usize> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SEQ_FILE_MAGIC {
            return Err(KvError::InvalidFile("bad magic".into()));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != SEQ_FILE_VERSION {
            return Err(KvError::InvalidFile(format!(
                "version mismatch: found {version}, expected {SEQ_FILE_VERSION}"
            )));
        }

        let expected_crc = reader.read_u32::<LittleEndian>()?;
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        let actual_crc = crc32fast::hash(&body);
        if actual_crc != expected_crc {
            return Err(KvError::InvalidFile(format!(
                "crc mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            )));
        }

        let mut cursor = Cursor::new(body);
        let n_layers = cursor.read_u32::<LittleEndian>()? as usize;
        let kv_dim = cursor.read_u32::<LittleEndian>()? as usize;
        if n_layers != self.n_layers() || kv_dim != self.kv_dim() {
            return Err(KvError::InvalidFile(format!(
                "shape mismatch: file is {n_layers}x{kv_dim}, cache is {}x{}",
                self.n_layers(),
                self.kv_dim()
            )));
        }

        let mut per_layer: Vec<Vec<Cell>> = Vec::with_capacity(n_layers);
        for _ in 0..n_layers {
            let n_cells = cursor.read_u32::<LittleEndian>()? as usize;
            if n_cells > self.n_ctx_slot() {
                return Err(KvError::Full { seq });
            }
            let mut cells = Vec::with_capacity(n_cells);
            for _ in 0..n_cells {
                let pos = cursor.read_i32::<LittleEndian>()?;
                let mut k = Vec::with_capacity(kv_dim);
                for _ in 0..kv_dim {
                    k.push(f16::from_bits(cursor.read_u16::<LittleEndian>()?));
                }
                let mut v = Vec::with_capacity(kv_dim);
                for _ in 0..kv_dim {
                    v.push(f16::from_bits(cursor.read_u16::<LittleEndian>()?));
                }
                cells.push(Cell { pos, k, v });
            }
            per_layer.push(cells);
        }

        self.apply(KvMutation::remove_all(seq))?;
        for (layer, cells) in per_layer.into_iter().enumerate() {
            for cell in cells {
                self.write(layer, seq, cell.pos, cell.k, cell.v)?;
            }
        }

        Ok(self.seq_len(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn row(x: f32) -> Vec<f16> {
        vec![f16::from_f32(x); 4]
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let path = env::temp_dir().join("ringlm-kv-roundtrip.rlkv");

        let mut cache = KvCache::new(2, 32, 4);
        for layer in 0..2 {
            for pos in 0..5 {
                cache
                    .write(layer, 7, pos, row(pos as f32), row(pos as f32 + 0.5))
                    .unwrap();
            }
        }

        let saved = cache.seq_save(7, &path).unwrap();
        assert_eq!(saved, 5);

        let mut fresh = KvCache::new(2, 32, 4);
        let restored = fresh.seq_restore(7, &path).unwrap();
        assert_eq!(restored, 5);

        for layer in 0..2 {
            assert_eq!(fresh.cells(layer, 7), cache.cells(layer, 7));
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let path = env::temp_dir().join("ringlm-kv-corrupt.rlkv");

        let mut cache = KvCache::new(1, 32, 4);
        cache.write(0, 1, 0, row(1.0), row(2.0)).unwrap();
        cache.seq_save(1, &path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let mut fresh = KvCache::new(1, 32, 4);
        let err = fresh.seq_restore(1, &path).unwrap_err();
        assert!(matches!(err, KvError::InvalidFile(_)));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let path = env::temp_dir().join("ringlm-kv-shape.rlkv");

        let mut cache = KvCache::new(1, 32, 4);
        cache.write(0, 1, 0, row(1.0), row(2.0)).unwrap();
        cache.seq_save(1, &path).unwrap();

        let mut fresh = KvCache::new(2, 32, 4);
        let err = fresh.seq_restore(1, &path).unwrap_err();
        assert!(matches!(err, KvError::InvalidFile(_)));

        let _ = fs::remove_file(&path);
    }
}
