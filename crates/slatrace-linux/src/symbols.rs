//! Kernel symbol resolution from a System.map file.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    path::Path,
};

use slatrace_core::{Error, Va};

/// The kernel's symbol table, as exported at build time.
///
/// Each line of a System.map is `address type name`; everything that does
/// not look like that is skipped.
pub struct SymbolTable {
    by_name: HashMap<String, Va>,
}

impl SymbolTable {
    /// Parses a System.map from a reader.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, Error> {
        let mut by_name = HashMap::new();

        for line in reader.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();

            let address = fields.next();
            let _kind = fields.next();
            let name = fields.next();

            let (address, name) = match (address, name) {
                (Some(address), Some(name)) => (address, name),
                _ => continue,
            };

            let address = match u64::from_str_radix(address, 16) {
                Ok(address) => address,
                Err(_) => continue,
            };

            by_name.insert(name.to_string(), Va(address));
        }

        if by_name.is_empty() {
            return Err(Error::Config("no symbols parsed from System.map".into()));
        }

        Ok(Self { by_name })
    }

    /// Parses a System.map file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Looks a symbol up.
    pub fn get(&self, name: &str) -> Option<Va> {
        self.by_name.get(name).copied()
    }

    /// Number of symbols in the table.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
