//! Working set of resolved addresses for one service name.

use crate::record::ServiceRecord;

/// One resolved endpoint handed to the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: String,
    pub weight: i32,
}

impl Address {
    #[must_use]
    pub fn new(addr: impl Into<String>, weight: i32) -> Self {
        Self {
            addr: addr.into(),
            weight,
        }
    }
}

impl From<&ServiceRecord> for Address {
    fn from(record: &ServiceRecord) -> Self {
        Self::new(record.addr.clone(), record.weight)
    }
}

/// Address list keyed by `addr`: no two entries ever share an address.
///
/// Order is not meaningful; removal swaps the last entry into the freed slot.
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    entries: Vec<Address>,
}

impl AddressList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list. Later duplicates of an address win.
    pub fn replace(&mut self, addresses: impl IntoIterator<Item = Address>) {
        self.entries.clear();
        for address in addresses {
            self.upsert(address);
        }
    }

    /// Insert a new address or update the metadata of an existing one.
    ///
    /// Returns `true` if the list changed.
    pub fn upsert(&mut self, address: Address) -> bool {
        match self.entries.iter_mut().find(|a| a.addr == address.addr) {
            Some(existing) if *existing == address => false,
            Some(existing) => {
                *existing = address;
                true
            }
            None => {
                self.entries.push(address);
                true
            }
        }
    }

    /// Remove the entry with the given address. Returns `true` if one was removed.
    pub fn remove(&mut self, addr: &str) -> bool {
        match self.entries.iter().position(|a| a.addr == addr) {
            Some(pos) => {
                self.entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, addr: &str) -> bool {
        self.entries.iter().any(|a| a.addr == addr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Address] {
        &self.entries
    }

    /// Full copy of the list, as pushed to the connection pool.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Address> {
        self.entries.clone()
    }
}
