//! Page Replacement Policies
//!
//! Chooses which resident page to evict when a process's resident set is
//! full. Exactly one policy is active for an address space:
//!
//! - **NFUA** (not frequently used, with aging): every tick each resident
//!   page's counter is shifted right and the hardware accessed bit is
//!   shifted in at bit 63. The smallest counter is evicted.
//! - **LAPA** (least accessed page, with aging): same aging, but pages are
//!   ranked by how many bits are set in the counter, then by counter value.
//!   New pages start with every bit set.
//! - **SCFIFO** (second-chance FIFO): the counter is a load timestamp. The
//!   oldest page is evicted unless its accessed bit is set, in which case
//!   the bit is cleared and the page is re-stamped as newest.
//! - **NONE**: paging disabled; nothing is tracked or evicted.
//!
//! Ties always go to the entry earliest in ledger table order.

use core::fmt;

use crate::vm::ledger::{Ledger, PageHandle};
use crate::vm::pmap::{PageTable, PteFlags};

// ============================================================================
// Policy Kind
// ============================================================================

/// Replacement algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// Paging disabled
    None,
    /// Aging counter, smallest value evicted
    Nfua,
    /// Aging counter, fewest set bits evicted
    Lapa,
    /// Second-chance FIFO
    Scfifo,
}

impl PolicyKind {
    /// Policy selected by cargo features (none > nfua > lapa > scfifo)
    pub const fn compiled() -> Self {
        if cfg!(feature = "none") {
            PolicyKind::None
        } else if cfg!(feature = "nfua") {
            PolicyKind::Nfua
        } else if cfg!(feature = "lapa") {
            PolicyKind::Lapa
        } else {
            PolicyKind::Scfifo
        }
    }

    /// Does this policy page at all?
    pub const fn is_paging(self) -> bool {
        !matches!(self, PolicyKind::None)
    }

    /// Shared instance implementing this policy
    pub fn policy(self) -> &'static dyn ReplacementPolicy {
        match self {
            PolicyKind::None => &NO_PAGING,
            PolicyKind::Nfua => &NFUA,
            PolicyKind::Lapa => &LAPA,
            PolicyKind::Scfifo => &SCFIFO,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            PolicyKind::None => "NONE",
            PolicyKind::Nfua => "NFUA",
            PolicyKind::Lapa => "LAPA",
            PolicyKind::Scfifo => "SCFIFO",
        }
    }
}

impl Default for PolicyKind {
    fn default() -> Self {
        Self::compiled()
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Policy Trait
// ============================================================================

/// Victim chosen by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    pub handle: PageHandle,
    /// Pages spared because their accessed bit was set
    pub second_chances: u32,
}

/// Replacement policy hooks driven by the address space
pub trait ReplacementPolicy: Sync {
    fn kind(&self) -> PolicyKind;

    /// Initialize the recency value of a page that just became resident
    fn on_load(&self, ledger: &mut Ledger, handle: PageHandle);

    /// Periodic bookkeeping from the scheduler tick. Returns pages aged.
    fn on_tick(&self, ledger: &mut Ledger, page_table: &mut dyn PageTable) -> usize;

    /// Pick the resident page to evict. Panics if nothing is resident.
    fn select_victim(&self, ledger: &mut Ledger, page_table: &mut dyn PageTable) -> Victim;
}

/// Earliest resident entry minimizing `key`
fn min_resident_by<K: Ord>(ledger: &Ledger, key: impl Fn(u64) -> K) -> PageHandle {
    let mut best: Option<(K, PageHandle)> = None;
    for (handle, page) in ledger.resident() {
        let k = key(page.recency());
        let better = match &best {
            Some((best_key, _)) => k < *best_key,
            None => true,
        };
        if better {
            best = Some((k, handle));
        }
    }
    match best {
        Some((_, handle)) => handle,
        None => panic!("select_victim: no resident pages"),
    }
}

/// Shift every resident counter right, feeding the accessed bit into bit 63
fn age_resident(ledger: &mut Ledger, page_table: &mut dyn PageTable) -> usize {
    let mut aged = 0;
    for i in 0..ledger.capacity() {
        let handle = PageHandle(i);
        let page = ledger.get(handle);
        if !page.is_resident() {
            continue;
        }
        let va = page.va();
        let recency = page.recency();

        let pte = match page_table.walk(va, false) {
            Some(pte) => pte,
            None => panic!("aging: resident page {:#x} has no pte", va.0),
        };
        let accessed = pte.contains(PteFlags::ACCESSED);
        pte.remove(PteFlags::ACCESSED);

        let top = if accessed { 1u64 << 63 } else { 0 };
        ledger.set_recency(handle, (recency >> 1) | top);
        aged += 1;
    }
    log::trace!("aged {} resident pages", aged);
    aged
}

// ============================================================================
// Policies
// ============================================================================

/// Paging disabled
pub struct NoPaging;

impl ReplacementPolicy for NoPaging {
    fn kind(&self) -> PolicyKind {
        PolicyKind::None
    }

    fn on_load(&self, _ledger: &mut Ledger, _handle: PageHandle) {}

    fn on_tick(&self, _ledger: &mut Ledger, _page_table: &mut dyn PageTable) -> usize {
        0
    }

    fn select_victim(&self, _ledger: &mut Ledger, _page_table: &mut dyn PageTable) -> Victim {
        panic!("select_victim: paging disabled");
    }
}

/// Not frequently used, with aging
pub struct Nfua;

impl ReplacementPolicy for Nfua {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Nfua
    }

    fn on_load(&self, ledger: &mut Ledger, handle: PageHandle) {
        ledger.set_recency(handle, 0);
    }

    fn on_tick(&self, ledger: &mut Ledger, page_table: &mut dyn PageTable) -> usize {
        age_resident(ledger, page_table)
    }

    fn select_victim(&self, ledger: &mut Ledger, _page_table: &mut dyn PageTable) -> Victim {
        Victim {
            handle: min_resident_by(ledger, |recency| recency),
            second_chances: 0,
        }
    }
}

/// Least accessed page, with aging
pub struct Lapa;

impl ReplacementPolicy for Lapa {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lapa
    }

    fn on_load(&self, ledger: &mut Ledger, handle: PageHandle) {
        ledger.set_recency(handle, !0);
    }

    fn on_tick(&self, ledger: &mut Ledger, page_table: &mut dyn PageTable) -> usize {
        age_resident(ledger, page_table)
    }

    fn select_victim(&self, ledger: &mut Ledger, _page_table: &mut dyn PageTable) -> Victim {
        Victim {
            handle: min_resident_by(ledger, |recency| (recency.count_ones(), recency)),
            second_chances: 0,
        }
    }
}

/// Second-chance FIFO
pub struct Scfifo;

impl ReplacementPolicy for Scfifo {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Scfifo
    }

    fn on_load(&self, ledger: &mut Ledger, handle: PageHandle) {
        let now = ledger.next_generation();
        ledger.set_recency(handle, now);
    }

    fn on_tick(&self, _ledger: &mut Ledger, _page_table: &mut dyn PageTable) -> usize {
        0
    }

    fn select_victim(&self, ledger: &mut Ledger, page_table: &mut dyn PageTable) -> Victim {
        let mut second_chances = 0;
        loop {
            let handle = min_resident_by(ledger, |stamp| stamp);
            let va = ledger.get(handle).va();
            let pte = match page_table.walk(va, false) {
                Some(pte) => pte,
                None => panic!("scfifo: resident page {:#x} has no pte", va.0),
            };

            if !pte.contains(PteFlags::ACCESSED) {
                return Victim {
                    handle,
                    second_chances,
                };
            }

            pte.remove(PteFlags::ACCESSED);
            let now = ledger.next_generation();
            ledger.set_recency(handle, now);
            second_chances += 1;
            log::trace!("scfifo: second chance for {:#x}", va.0);
        }
    }
}

static NO_PAGING: NoPaging = NoPaging;
static NFUA: Nfua = Nfua;
static LAPA: Lapa = Lapa;
static SCFIFO: Scfifo = Scfifo;

// ============================================================================
// Tests
// ============================================================================
