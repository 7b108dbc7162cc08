//! Swapchain Proxy Table
//!
//! Per-session arena of backend swapchains. The client-visible `u32` is the
//! entry index. Each entry also carries a generation, bumped whenever it is
//! freed, so handles held inside the server go stale once their swapchain is
//! destroyed.

use std::fmt;

use tracing::warn;

use crate::backend::Swapchain;
use crate::error::ProtocolError;

/// Maximum swapchains one session may hold
pub const MAX_CLIENT_SWAPCHAINS: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainHandle {
    index: u32,
    generation: u32,
}

impl SwapchainHandle {
    /// Id sent to the client
    pub fn raw(self) -> u32 {
        self.index
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SwapchainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Swapchain({}@{})", self.index, self.generation)
    }
}

#[derive(Default)]
struct Entry {
    generation: u32,
    swapchain: Option<Box<dyn Swapchain>>,
}

pub struct SwapchainTable {
    entries: Vec<Entry>,
    /// Kept alongside the entries and checked against them
    count: usize,
}

impl Default for SwapchainTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapchainTable {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_CLIENT_SWAPCHAINS).map(|_| Entry::default()).collect(),
            count: 0,
        }
    }

    /// Lowest index with no swapchain
    pub fn lowest_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.swapchain.is_none())
    }

    pub fn is_full(&self) -> bool {
        self.lowest_free().is_none()
    }

    /// Store a swapchain at the lowest free index.
    ///
    /// Hands the swapchain back when the table is full.
    pub fn insert(&mut self, swapchain: Box<dyn Swapchain>) -> Result<SwapchainHandle, Box<dyn Swapchain>> {
        let Some(index) = self.lowest_free() else {
            return Err(swapchain);
        };
        let entry = &mut self.entries[index];
        entry.swapchain = Some(swapchain);
        self.count += 1;
        Ok(SwapchainHandle {
            index: index as u32,
            generation: entry.generation,
        })
    }

    /// Turn a client id into a handle for the current generation of its
    /// entry. An index past the end of the table is a protocol error.
    pub fn resolve(&self, id: u32) -> Result<SwapchainHandle, ProtocolError> {
        let entry = self
            .entries
            .get(id as usize)
            .ok_or(ProtocolError::InvalidSwapchain(id))?;
        Ok(SwapchainHandle {
            index: id,
            generation: entry.generation,
        })
    }

    fn live_entry(&mut self, handle: SwapchainHandle) -> Option<&mut Entry> {
        self.entries
            .get_mut(handle.index())
            .filter(|e| e.swapchain.is_some() && e.generation == handle.generation())
    }

    #[cfg(test)]
    pub fn is_active(&self, handle: SwapchainHandle) -> bool {
        self.entries
            .get(handle.index())
            .is_some_and(|e| e.swapchain.is_some() && e.generation == handle.generation())
    }

    /// Resolve a handle. Anything but a live handle is a protocol error.
    pub fn get_mut(&mut self, handle: SwapchainHandle) -> Result<&mut Box<dyn Swapchain>, ProtocolError> {
        self.live_entry(handle)
            .and_then(|e| e.swapchain.as_mut())
            .ok_or(ProtocolError::InvalidSwapchain(handle.raw()))
    }

    /// Take a swapchain out of the table, retiring its handle.
    ///
    /// An in-range index whose entry is free or from an older generation
    /// yields `Ok(None)`.
    pub fn remove(&mut self, handle: SwapchainHandle) -> Result<Option<Box<dyn Swapchain>>, ProtocolError> {
        if handle.index() >= self.entries.len() {
            return Err(ProtocolError::InvalidSwapchain(handle.raw()));
        }
        let Some(entry) = self.live_entry(handle) else {
            warn!("Ignoring destroy of stale or inactive {:?}", handle);
            return Ok(None);
        };
        let swapchain = entry.swapchain.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.count -= 1;
        Ok(swapchain)
    }

    /// Destroy every swapchain. Returns how many were live.
    pub fn clear(&mut self) -> usize {
        self.count = 0;
        let mut destroyed = 0;
        for entry in &mut self.entries {
            if entry.swapchain.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Running count of live swapchains
    pub fn count(&self) -> usize {
        self.count
    }

    /// Live swapchains found by scanning the entries
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.swapchain.is_some()).count()
    }

    pub fn check_count(&self) -> Result<(), ProtocolError> {
        let active = self.active_count();
        if self.count != active {
            return Err(ProtocolError::SwapchainCountMismatch {
                counted: self.count,
                active,
            });
        }
        Ok(())
    }
}
