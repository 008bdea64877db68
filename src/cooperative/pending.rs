use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use musig2::PubNonce;
use serde::Serialize;

use super::musig::MusigSession;
use crate::chain::transaction::SwapTransaction;
use crate::swap::{AnySwap, SwapKind};

/// Claim of the interactive path: the sweep destination and transaction are
/// fixed once built, the session is replaced on every request.
#[derive(Debug, Clone)]
pub struct CooperativeDetails {
    pub musig: MusigSession,
    pub sweep_address: String,
    pub transaction: SwapTransaction,
}

#[derive(Debug, Clone)]
pub struct SwapToClaim {
    pub swap: AnySwap,
    pub preimage: [u8; 32],
    pub cooperative: Option<CooperativeDetails>,
}

impl SwapToClaim {
    pub fn new(swap: AnySwap, preimage: [u8; 32]) -> Self {
        Self {
            swap,
            preimage,
            cooperative: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingValue {
    pub kind: SwapKind,
    pub swap_id: String,
    pub onchain_amount: Option<u64>,
}

type Queue = BTreeMap<String, SwapToClaim>;

/// Queues of swaps waiting for a batch claim, per symbol and swap kind.
///
/// Only symbols given at construction ever hold entries. The lock is held for
/// single map mutations only.
#[derive(Debug)]
pub struct PendingClaims {
    queues: Mutex<HashMap<String, BTreeMap<SwapKind, Queue>>>,
}

impl PendingClaims {
    pub fn new<S: Into<String>>(symbols: impl IntoIterator<Item = S>) -> Self {
        let queues = symbols
            .into_iter()
            .map(|symbol| {
                let by_kind = [SwapKind::Submarine, SwapKind::Chain]
                    .into_iter()
                    .map(|kind| (kind, Queue::new()))
                    .collect();
                (symbol.into(), by_kind)
            })
            .collect();
        Self {
            queues: Mutex::new(queues),
        }
    }

    pub fn is_deferred(&self, symbol: &str) -> bool {
        self.lock().contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Queues `entry`; an already queued swap keeps its cooperative details.
    /// Returns false if the symbol does not batch.
    pub fn insert(&self, entry: SwapToClaim) -> bool {
        let mut queues = self.lock();
        let Some(queue) = queues
            .get_mut(entry.swap.chain_symbol())
            .and_then(|by_kind| by_kind.get_mut(&entry.swap.kind()))
        else {
            return false;
        };

        match queue.get_mut(entry.swap.id()) {
            Some(existing) => {
                existing.swap = entry.swap;
                existing.preimage = entry.preimage;
            }
            None => {
                queue.insert(entry.swap.id().to_string(), entry);
            }
        }
        true
    }

    /// Empties every queue of `symbol` and returns what was in them.
    pub fn drain(&self, symbol: &str) -> Vec<SwapToClaim> {
        let mut queues = self.lock();
        let Some(by_kind) = queues.get_mut(symbol) else {
            return Vec::new();
        };
        by_kind
            .values_mut()
            .flat_map(|queue| std::mem::take(queue).into_values())
            .collect()
    }

    /// Puts drained entries back after a failed sweep.
    pub fn reinsert(&self, entries: impl IntoIterator<Item = SwapToClaim>) {
        let mut queues = self.lock();
        for entry in entries {
            let Some(queue) = queues
                .get_mut(entry.swap.chain_symbol())
                .and_then(|by_kind| by_kind.get_mut(&entry.swap.kind()))
            else {
                continue;
            };
            queue.entry(entry.swap.id().to_string()).or_insert(entry);
        }
    }

    pub fn remove(&self, symbol: &str, kind: SwapKind, swap_id: &str) -> Option<SwapToClaim> {
        self.lock()
            .get_mut(symbol)
            .and_then(|by_kind| by_kind.get_mut(&kind))
            .and_then(|queue| queue.remove(swap_id))
    }

    pub fn get(&self, symbol: &str, kind: SwapKind, swap_id: &str) -> Option<SwapToClaim> {
        self.lock()
            .get(symbol)
            .and_then(|by_kind| by_kind.get(&kind))
            .and_then(|queue| queue.get(swap_id))
            .cloned()
    }

    /// Attaches `built` to a queued swap and returns the stored details.
    ///
    /// If the swap already has details, only the session is replaced so the
    /// sweep address and transaction never change. `None` if the swap left the
    /// queue in the meantime.
    pub fn set_cooperative(
        &self,
        symbol: &str,
        kind: SwapKind,
        swap_id: &str,
        built: CooperativeDetails,
    ) -> Option<CooperativeDetails> {
        let mut queues = self.lock();
        let entry = queues
            .get_mut(symbol)
            .and_then(|by_kind| by_kind.get_mut(&kind))
            .and_then(|queue| queue.get_mut(swap_id))?;

        match entry.cooperative.as_mut() {
            Some(existing) => existing.musig = built.musig,
            None => entry.cooperative = Some(built),
        }
        entry.cooperative.clone()
    }

    /// Burns the secret nonce of a swap's stored session if that session
    /// still uses `pub_nonce`. A session replaced in the meantime is kept.
    pub fn discard_nonce(
        &self,
        symbol: &str,
        kind: SwapKind,
        swap_id: &str,
        pub_nonce: &PubNonce,
    ) -> bool {
        match self
            .lock()
            .get_mut(symbol)
            .and_then(|by_kind| by_kind.get_mut(&kind))
            .and_then(|queue| queue.get_mut(swap_id))
            .and_then(|entry| entry.cooperative.as_mut())
        {
            Some(details) if details.musig.public_nonce() == pub_nonce => {
                details.musig.discard_nonce();
                true
            }
            _ => false,
        }
    }

    /// Queued swap ids per symbol and kind.
    pub fn pending_sweeps(&self) -> BTreeMap<String, BTreeMap<SwapKind, Vec<String>>> {
        self.lock()
            .iter()
            .map(|(symbol, by_kind)| {
                let ids = by_kind
                    .iter()
                    .map(|(kind, queue)| (*kind, queue.keys().cloned().collect()))
                    .collect();
                (symbol.clone(), ids)
            })
            .collect()
    }

    pub fn pending_values(&self) -> BTreeMap<String, Vec<PendingValue>> {
        self.lock()
            .iter()
            .map(|(symbol, by_kind)| {
                let values = by_kind
                    .iter()
                    .flat_map(|(kind, queue)| {
                        queue.values().map(|entry| PendingValue {
                            kind: *kind,
                            swap_id: entry.swap.id().to_string(),
                            onchain_amount: entry.swap.claim_leg().onchain_amount,
                        })
                    })
                    .collect();
                (symbol.clone(), values)
            })
            .collect()
    }

    /// Sum of the known on-chain amounts queued for `symbol`.
    pub fn pending_amount(&self, symbol: &str) -> u64 {
        self.lock()
            .get(symbol)
            .map(|by_kind| {
                by_kind
                    .values()
                    .flat_map(|queue| queue.values())
                    .filter_map(|entry| entry.swap.claim_leg().onchain_amount)
                    .sum()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<SwapKind, Queue>>> {
        self.queues.lock().expect("pending claims mutex poisoned")
    }
}
