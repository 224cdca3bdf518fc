//! Card-table write barrier.
//!
//! One dirty byte per [`CARD_SIZE`] region of address space. The indexing
//! formula — `card = address >> CARD_SHIFT` — and the granularity are a
//! stable contract with compiled code: every pointer store into a
//! barrier-tracked object must call [`WriteBarrierTable::record_write`] on
//! the field address before or immediately after the store.
//!
//! On 64-bit address spaces a flat table is not affordable, so the table is
//! a sparse map of fixed-size chunks committed lazily when the heap reserves
//! pages in a region ([`WriteBarrierTable::on_region_reserved`]) and trimmed
//! when the last region covered by a chunk is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

/// log2 of the bytes covered by one card.
pub const CARD_SHIFT: usize = 12;

/// Bytes covered by one dirty byte.
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;

/// Cards per lazily-committed table chunk (one chunk covers 16 MiB of
/// address space at the default granularity).
const CHUNK_CARDS: usize = 4096;

const fn chunk_index(addr: usize) -> usize {
    addr >> CARD_SHIFT >> CHUNK_CARDS.trailing_zeros()
}

const fn card_in_chunk(addr: usize) -> usize {
    (addr >> CARD_SHIFT) & (CHUNK_CARDS - 1)
}

struct CardChunk {
    cards: Box<[AtomicU8]>,
    /// Reserved regions currently covered; the chunk is dropped at zero.
    refs: usize,
}

impl CardChunk {
    fn new() -> Self {
        Self {
            cards: (0..CHUNK_CARDS).map(|_| AtomicU8::new(0)).collect(),
            refs: 0,
        }
    }
}

/// The process-visible dirty-region table for one collector instance.
pub struct WriteBarrierTable {
    chunks: RwLock<HashMap<usize, CardChunk>>,
}

impl Default for WriteBarrierTable {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBarrierTable {
    /// An empty table; chunks appear as heap regions are reserved.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Record a pointer store into `addr`.
    ///
    /// Release ordering pairs with the acquire read in the rescan so a
    /// marker that observes a clean card has also observed every store the
    /// mutator made before dirtying it. Stores into regions never reserved
    /// for barrier-tracked objects are ignored.
    #[inline]
    pub fn record_write(&self, addr: usize) {
        let chunks = self.chunks.read();
        if let Some(chunk) = chunks.get(&chunk_index(addr)) {
            chunk.cards[card_in_chunk(addr)].store(1, Ordering::Release);
        }
    }

    /// Is the card covering `addr` dirty?
    #[must_use]
    pub fn is_dirty(&self, addr: usize) -> bool {
        let chunks = self.chunks.read();
        chunks
            .get(&chunk_index(addr))
            .is_some_and(|c| c.cards[card_in_chunk(addr)].load(Ordering::Acquire) != 0)
    }

    /// Clear every card intersecting `[addr, addr + len)`. Only the
    /// collector calls this, after the region has been rescanned.
    pub fn clear_range(&self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        let chunks = self.chunks.read();
        let mut card = addr & !(CARD_SIZE - 1);
        let end = addr + len;
        while card < end {
            if let Some(chunk) = chunks.get(&chunk_index(card)) {
                chunk.cards[card_in_chunk(card)].store(0, Ordering::Release);
            }
            card += CARD_SIZE;
        }
    }

    /// Commit table chunks covering a newly reserved heap region.
    pub fn on_region_reserved(&self, addr: usize, page_count: usize) {
        let len = page_count * page_source::page_size();
        let mut chunks = self.chunks.write();
        for index in Self::chunk_range(addr, len) {
            chunks.entry(index).or_insert_with(CardChunk::new).refs += 1;
        }
    }

    /// Release table chunks when the last covered region goes away.
    pub fn on_region_released(&self, addr: usize, page_count: usize) {
        let len = page_count * page_source::page_size();
        let mut chunks = self.chunks.write();
        for index in Self::chunk_range(addr, len) {
            if let Some(chunk) = chunks.get_mut(&index) {
                chunk.refs -= 1;
                if chunk.refs == 0 {
                    chunks.remove(&index);
                }
            }
        }
    }

    fn chunk_range(addr: usize, len: usize) -> impl Iterator<Item = usize> {
        let first = chunk_index(addr);
        let last = chunk_index(addr + len.max(1) - 1);
        first..=last
    }

    /// Invoke `f` with the start address of every dirty card intersecting
    /// `[addr, addr + len)`, without clearing them.
    pub fn for_each_dirty_card(&self, addr: usize, len: usize, f: &mut dyn FnMut(usize)) {
        if len == 0 {
            return;
        }
        let chunks = self.chunks.read();
        let mut card = addr & !(CARD_SIZE - 1);
        let end = addr + len;
        while card < end {
            if let Some(chunk) = chunks.get(&chunk_index(card)) {
                if chunk.cards[card_in_chunk(card)].load(Ordering::Acquire) != 0 {
                    f(card);
                }
            }
            card += CARD_SIZE;
        }
    }

    /// Collect and clear every dirty card in the table. Only valid with the
    /// mutator stopped (the final rescan before sweep): a store racing this
    /// drain could otherwise be cleared without being rescanned.
    pub fn drain_dirty_cards(&self) -> Vec<usize> {
        let chunks = self.chunks.read();
        let mut dirty = Vec::new();
        for (&chunk_idx, chunk) in chunks.iter() {
            for (card_idx, card) in chunk.cards.iter().enumerate() {
                if card.swap(0, Ordering::AcqRel) != 0 {
                    dirty.push(((chunk_idx << CHUNK_CARDS.trailing_zeros()) + card_idx) << CARD_SHIFT);
                }
            }
        }
        dirty
    }

    /// Count dirty cards in a range. Diagnostic.
    #[must_use]
    pub fn dirty_card_count(&self, addr: usize, len: usize) -> usize {
        let mut n = 0;
        self.for_each_dirty_card(addr, len, &mut |_| n += 1);
        n
    }
}
