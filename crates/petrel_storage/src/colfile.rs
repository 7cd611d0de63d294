//! Column file encoding shared by table partitions and WAL segments.
//!
//! Fixed-width columns store one little-endian value per row in `<name>.d`.
//! String columns pair `<name>.d` (i32-length-prefixed UTF-8, -1 for null)
//! with `<name>.i` (one i64 data offset per row). Symbol columns store i32
//! codes in `<name>.d`; the dictionary lives in an append-only `<name>.k`
//! file of length-prefixed strings, where a symbol's code is its position.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{ColumnType, Value};

use crate::fs::FilesFacade;

pub const NULL_INT: i32 = i32::MIN;
pub const NULL_LONG: i64 = i64::MIN;
pub const NULL_SYMBOL_CODE: i32 = -1;

pub fn data_file(dir: &Path, column_name: &str) -> PathBuf {
    dir.join(format!("{column_name}.d"))
}

pub fn aux_file(dir: &Path, column_name: &str) -> PathBuf {
    dir.join(format!("{column_name}.i"))
}

pub fn dict_file(dir: &Path, column_name: &str) -> PathBuf {
    dir.join(format!("{column_name}.k"))
}

fn fixed_bytes(column_name: &str, col_type: ColumnType, value: &Value) -> PetrelResult<Vec<u8>> {
    let mismatch = || PetrelError::InvalidColumnValue {
        column: column_name.to_string(),
        expected: format!("{col_type:?}"),
    };
    let bytes = match (col_type, value) {
        (ColumnType::Bool, Value::Bool(v)) => vec![*v as u8],
        (ColumnType::Bool, Value::Null) => vec![0u8],
        (ColumnType::Byte, Value::Byte(v)) => vec![*v as u8],
        (ColumnType::Byte, Value::Null) => vec![0u8],
        (ColumnType::Short, Value::Short(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Short, Value::Null) => 0i16.to_le_bytes().to_vec(),
        (ColumnType::Char, Value::Char(v)) => (*v as u16).to_le_bytes().to_vec(),
        (ColumnType::Char, Value::Null) => 0u16.to_le_bytes().to_vec(),
        (ColumnType::Int, Value::Int(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Int, Value::Null) => NULL_INT.to_le_bytes().to_vec(),
        (ColumnType::Long, Value::Long(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Long, Value::Null) => NULL_LONG.to_le_bytes().to_vec(),
        (ColumnType::Float, Value::Float(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Float, Value::Null) => f32::NAN.to_le_bytes().to_vec(),
        (ColumnType::Double, Value::Double(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Double, Value::Null) => f64::NAN.to_le_bytes().to_vec(),
        (ColumnType::Date, Value::Date(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Date, Value::Null) => NULL_LONG.to_le_bytes().to_vec(),
        (ColumnType::Timestamp, Value::Timestamp(v)) => v.to_le_bytes().to_vec(),
        (ColumnType::Timestamp, Value::Null) => NULL_LONG.to_le_bytes().to_vec(),
        _ => return Err(mismatch()),
    };
    Ok(bytes)
}

/// Appends `values` of a fixed-width or string column to the files in `dir`.
/// Symbol columns go through [`append_symbol_codes`].
pub fn append_values(
    ff: FilesFacade,
    dir: &Path,
    column_name: &str,
    col_type: ColumnType,
    values: &[Value],
) -> PetrelResult<()> {
    match col_type {
        ColumnType::Str => {
            let mut data = ff.open_append(&data_file(dir, column_name))?;
            let mut aux = ff.open_append(&aux_file(dir, column_name))?;
            let mut offset = data.metadata()?.len();
            for v in values {
                aux.write_all(&(offset as i64).to_le_bytes())?;
                match v {
                    Value::Str(s) => {
                        data.write_all(&(s.len() as i32).to_le_bytes())?;
                        data.write_all(s.as_bytes())?;
                        offset += 4 + s.len() as u64;
                    }
                    Value::Null => {
                        data.write_all(&(-1i32).to_le_bytes())?;
                        offset += 4;
                    }
                    _ => {
                        return Err(PetrelError::InvalidColumnValue {
                            column: column_name.to_string(),
                            expected: "Str".to_string(),
                        })
                    }
                }
            }
            Ok(())
        }
        ColumnType::Symbol => Err(PetrelError::InvalidColumnValue {
            column: column_name.to_string(),
            expected: "symbol codes via append_symbol_codes".to_string(),
        }),
        _ => {
            let mut data = ff.open_append(&data_file(dir, column_name))?;
            for v in values {
                data.write_all(&fixed_bytes(column_name, col_type, v)?)?;
            }
            Ok(())
        }
    }
}

pub fn append_symbol_codes(
    ff: FilesFacade,
    dir: &Path,
    column_name: &str,
    codes: &[i32],
) -> PetrelResult<()> {
    let mut data = ff.open_append(&data_file(dir, column_name))?;
    for code in codes {
        data.write_all(&code.to_le_bytes())?;
    }
    Ok(())
}

/// Reads row `row` of a column's files in `dir`. Symbol columns yield the
/// raw `Value::Int` code (or null); the caller resolves it through the
/// dictionary.
pub fn read_value(
    ff: FilesFacade,
    dir: &Path,
    column_name: &str,
    col_type: ColumnType,
    row: u64,
) -> PetrelResult<Value> {
    match col_type {
        ColumnType::Str => {
            let aux = ff.open_ro(&aux_file(dir, column_name))?;
            let mut buf8 = [0u8; 8];
            ff.read_at(&aux, &mut buf8, row * 8)?;
            let offset = i64::from_le_bytes(buf8) as u64;
            let data = ff.open_ro(&data_file(dir, column_name))?;
            let mut buf4 = [0u8; 4];
            ff.read_at(&data, &mut buf4, offset)?;
            let len = i32::from_le_bytes(buf4);
            if len < 0 {
                return Ok(Value::Null);
            }
            let mut bytes = vec![0u8; len as usize];
            ff.read_at(&data, &mut bytes, offset + 4)?;
            let s = String::from_utf8(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Value::Str(s))
        }
        ColumnType::Symbol => {
            let data = ff.open_ro(&data_file(dir, column_name))?;
            let mut buf = [0u8; 4];
            ff.read_at(&data, &mut buf, row * 4)?;
            let code = i32::from_le_bytes(buf);
            if code == NULL_SYMBOL_CODE {
                Ok(Value::Null)
            } else {
                Ok(Value::Int(code))
            }
        }
        other => {
            let size = other.fixed_size().expect("fixed-width type") as u64;
            let data = ff.open_ro(&data_file(dir, column_name))?;
            let mut buf = vec![0u8; size as usize];
            ff.read_at(&data, &mut buf, row * size)?;
            Ok(decode_fixed(other, &buf))
        }
    }
}

fn decode_fixed(col_type: ColumnType, buf: &[u8]) -> Value {
    match col_type {
        ColumnType::Bool => Value::Bool(buf[0] != 0),
        ColumnType::Byte => Value::Byte(buf[0] as i8),
        ColumnType::Short => Value::Short(i16::from_le_bytes([buf[0], buf[1]])),
        ColumnType::Char => {
            let c = u16::from_le_bytes([buf[0], buf[1]]);
            Value::Char(char::from_u32(c as u32).unwrap_or('\u{fffd}'))
        }
        ColumnType::Int => {
            let v = i32::from_le_bytes(buf[..4].try_into().unwrap());
            if v == NULL_INT {
                Value::Null
            } else {
                Value::Int(v)
            }
        }
        ColumnType::Float => Value::Float(f32::from_le_bytes(buf[..4].try_into().unwrap())),
        ColumnType::Double => Value::Double(f64::from_le_bytes(buf[..8].try_into().unwrap())),
        ColumnType::Long | ColumnType::Date | ColumnType::Timestamp => {
            let v = i64::from_le_bytes(buf[..8].try_into().unwrap());
            if v == NULL_LONG {
                Value::Null
            } else if col_type == ColumnType::Timestamp {
                Value::Timestamp(v)
            } else if col_type == ColumnType::Date {
                Value::Date(v)
            } else {
                Value::Long(v)
            }
        }
        ColumnType::Str | ColumnType::Symbol => unreachable!("variable-width type"),
    }
}

/// Append-only symbol dictionary backed by a `.k` file. A symbol's code is
/// its position in the file, so re-appending an existing code is a no-op
/// and WAL replay stays idempotent.
pub struct SymbolDict {
    path: PathBuf,
    map: HashMap<String, i32>,
    values: Vec<String>,
    persisted: usize,
}

impl SymbolDict {
    pub fn load(ff: FilesFacade, path: PathBuf) -> PetrelResult<Self> {
        let mut values = Vec::new();
        if ff.exists(&path) {
            let mut file = ff.open_ro(&path)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            let mut p = 0;
            while p + 4 <= bytes.len() {
                let len = i32::from_le_bytes(bytes[p..p + 4].try_into().unwrap()) as usize;
                p += 4;
                let s = std::str::from_utf8(&bytes[p..p + len])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                    .to_string();
                p += len;
                values.push(s);
            }
        }
        let map = values
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i32))
            .collect();
        let persisted = values.len();
        Ok(Self {
            path,
            map,
            values,
            persisted,
        })
    }

    pub fn count(&self) -> i32 {
        self.values.len() as i32
    }

    pub fn code_of(&self, symbol: &str) -> Option<i32> {
        self.map.get(symbol).copied()
    }

    pub fn value_of(&self, code: i32) -> Option<&str> {
        self.values.get(code as usize).map(|s| s.as_str())
    }

    pub fn get_or_insert(&mut self, symbol: &str) -> i32 {
        if let Some(code) = self.map.get(symbol) {
            return *code;
        }
        let code = self.values.len() as i32;
        self.values.push(symbol.to_string());
        self.map.insert(symbol.to_string(), code);
        code
    }

    /// Appends entries not yet on disk.
    pub fn flush(&mut self, ff: FilesFacade) -> PetrelResult<()> {
        if self.persisted == self.values.len() {
            return Ok(());
        }
        let mut file = ff.open_append(&self.path)?;
        for s in &self.values[self.persisted..] {
            file.write_all(&(s.len() as i32).to_le_bytes())?;
            file.write_all(s.as_bytes())?;
        }
        ff.fdatasync(&file)?;
        self.persisted = self.values.len();
        Ok(())
    }
}
