//! Subscription Ledger
//!
//! Consolidated upstream subscription state for every subscriber of the
//! relay, plus the queue of raw requests waiting for the upstream session to
//! become ready.
//!
//! # Design
//!
//! The ledger keeps one symbol set per category (trades, quotes, bars):
//! - Symbols are upper-cased before they are stored
//! - A symbol is present if any subscriber asked for it
//! - There is no per-subscriber reference count: an unsubscribe removes the
//!   symbol for everyone
//!
//! The full state is replayed upstream as a single subscribe request after
//! every successful (re)authentication. The ledger has no interior locking;
//! it lives inside the relay's single state lock.

use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;

use crate::domain::streaming::messages::{ClientRequest, SubscriptionRequest};

// =============================================================================
// Types
// =============================================================================

/// A symbol string (stock ticker), stored upper-cased.
pub type Symbol = String;

/// Upper-case a symbol for storage.
#[must_use]
pub fn normalize_symbol(symbol: &str) -> Symbol {
    symbol.to_uppercase()
}

/// Market data category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Trade prints.
    Trades,
    /// NBBO quotes.
    Quotes,
    /// OHLCV bars.
    Bars,
}

impl Category {
    /// Get all categories.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Trades, Self::Quotes, Self::Bars]
    }

    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Quotes => "quotes",
            Self::Bars => "bars",
        }
    }
}

/// Direction of a ledger update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    /// Add symbols to the union.
    Subscribe,
    /// Remove symbols from the union.
    Unsubscribe,
}

/// Symbols named by a single request, per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorySymbols {
    /// Trade symbols.
    pub trades: Vec<Symbol>,
    /// Quote symbols.
    pub quotes: Vec<Symbol>,
    /// Bar symbols.
    pub bars: Vec<Symbol>,
}

impl CategorySymbols {
    /// Symbols for one category.
    #[must_use]
    pub fn get(&self, category: Category) -> &[Symbol] {
        match category {
            Category::Trades => &self.trades,
            Category::Quotes => &self.quotes,
            Category::Bars => &self.bars,
        }
    }
}

impl From<&ClientRequest> for CategorySymbols {
    fn from(request: &ClientRequest) -> Self {
        Self {
            trades: request.trades.clone(),
            quotes: request.quotes.clone(),
            bars: request.bars.clone(),
        }
    }
}

/// Where `route_or_queue` sent a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forwarded to the upstream immediately.
    Sent,
    /// Held until the upstream is ready.
    Queued,
}

/// Sorted view of the consolidated subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    /// Trade symbols.
    pub trades: Vec<Symbol>,
    /// Quote symbols.
    pub quotes: Vec<Symbol>,
    /// Bar symbols.
    pub bars: Vec<Symbol>,
}

/// Counts for health reporting and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Number of trade symbols.
    pub trades: usize,
    /// Number of quote symbols.
    pub quotes: usize,
    /// Number of bar symbols.
    pub bars: usize,
    /// Requests waiting for the upstream.
    pub pending: usize,
}

// =============================================================================
// Subscription Ledger
// =============================================================================

/// Union of every subscriber's requested symbols, with a pending queue.
///
/// # Example
///
/// ```rust
/// use market_data_relay::domain::subscription::{
///     CategorySymbols, SubscriptionAction, SubscriptionLedger,
/// };
///
/// let mut ledger = SubscriptionLedger::new();
///
/// let request = CategorySymbols {
///     trades: vec!["aapl".to_string()],
///     ..Default::default()
/// };
/// ledger.apply(SubscriptionAction::Subscribe, &request);
///
/// let restore = ledger.restore_request().unwrap();
/// assert_eq!(restore.trades, vec!["AAPL".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    trades: BTreeSet<Symbol>,
    quotes: BTreeSet<Symbol>,
    bars: BTreeSet<Symbol>,
    pending: VecDeque<String>,
}

impl SubscriptionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn set(&self, category: Category) -> &BTreeSet<Symbol> {
        match category {
            Category::Trades => &self.trades,
            Category::Quotes => &self.quotes,
            Category::Bars => &self.bars,
        }
    }

    fn set_mut(&mut self, category: Category) -> &mut BTreeSet<Symbol> {
        match category {
            Category::Trades => &mut self.trades,
            Category::Quotes => &mut self.quotes,
            Category::Bars => &mut self.bars,
        }
    }

    /// Apply a subscriber request to the union, whatever the upstream state.
    ///
    /// Returns the number of symbols that were added or removed.
    pub fn apply(&mut self, action: SubscriptionAction, symbols: &CategorySymbols) -> usize {
        let mut changed = 0;

        for category in Category::all() {
            let set = self.set_mut(*category);
            for symbol in symbols.get(*category) {
                let symbol = normalize_symbol(symbol);
                let did_change = match action {
                    SubscriptionAction::Subscribe => set.insert(symbol),
                    SubscriptionAction::Unsubscribe => set.remove(&symbol),
                };
                if did_change {
                    changed += 1;
                }
            }
        }

        changed
    }

    /// Offer a raw request to `send`; queue it if the upstream refuses.
    ///
    /// The payload is forwarded unmodified. Queued payloads are not merged
    /// or deduplicated.
    pub fn route_or_queue(&mut self, raw: String, send: impl FnOnce(&str) -> bool) -> RouteOutcome {
        if send(&raw) {
            RouteOutcome::Sent
        } else {
            self.pending.push_back(raw);
            RouteOutcome::Queued
        }
    }

    /// Append a raw request to the pending queue.
    pub fn enqueue(&mut self, raw: String) {
        self.pending.push_back(raw);
    }

    /// Take every pending request in enqueue order.
    pub fn drain_pending(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    /// Number of requests waiting for the upstream.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Build the single subscribe request that restores every subscription.
    ///
    /// Returns `None` when all categories are empty.
    #[must_use]
    pub fn restore_request(&self) -> Option<SubscriptionRequest> {
        if self.is_empty() {
            return None;
        }

        Some(
            SubscriptionRequest::subscribe()
                .with_trades(self.trades.iter().cloned().collect())
                .with_quotes(self.quotes.iter().cloned().collect())
                .with_bars(self.bars.iter().cloned().collect()),
        )
    }

    /// Sorted symbols for one category.
    #[must_use]
    pub fn symbols(&self, category: Category) -> Vec<Symbol> {
        self.set(category).iter().cloned().collect()
    }

    /// True when no category holds a symbol.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty() && self.quotes.is_empty() && self.bars.is_empty()
    }

    /// Sorted copy of the consolidated subscriptions.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            trades: self.symbols(Category::Trades),
            quotes: self.symbols(Category::Quotes),
            bars: self.symbols(Category::Bars),
        }
    }

    /// Get subscription statistics.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            trades: self.trades.len(),
            quotes: self.quotes.len(),
            bars: self.bars.len(),
            pending: self.pending.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn trades(symbols: &[&str]) -> CategorySymbols {
        CategorySymbols {
            trades: symbols.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn new_ledger_is_empty() {
        let ledger = SubscriptionLedger::new();
        assert!(ledger.is_empty());
        assert_eq!(ledger.stats(), LedgerStats::default());
        assert!(ledger.restore_request().is_none());
    }

    #[test]
    fn subscribe_normalizes_to_uppercase() {
        let mut ledger = SubscriptionLedger::new();
        ledger.apply(SubscriptionAction::Subscribe, &trades(&["aapl", "Msft"]));

        assert_eq!(ledger.symbols(Category::Trades), vec!["AAPL", "MSFT"]);
        assert!(ledger.symbols(Category::Quotes).is_empty());
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let mut ledger = SubscriptionLedger::new();
        assert_eq!(
            ledger.apply(SubscriptionAction::Subscribe, &trades(&["AAPL"])),
            1
        );
        assert_eq!(
            ledger.apply(SubscriptionAction::Subscribe, &trades(&["aapl"])),
            0
        );
        assert_eq!(ledger.stats().trades, 1);
    }

    #[test]
    fn unsubscribe_removes_for_everyone() {
        let mut ledger = SubscriptionLedger::new();

        // Two subscribers want AAPL, one of them later unsubscribes.
        ledger.apply(SubscriptionAction::Subscribe, &trades(&["AAPL"]));
        ledger.apply(SubscriptionAction::Subscribe, &trades(&["AAPL"]));
        ledger.apply(SubscriptionAction::Unsubscribe, &trades(&["aapl"]));

        assert!(ledger.symbols(Category::Trades).is_empty());
    }

    #[test]
    fn unsubscribe_unknown_symbol_is_noop() {
        let mut ledger = SubscriptionLedger::new();
        assert_eq!(
            ledger.apply(SubscriptionAction::Unsubscribe, &trades(&["TSLA"])),
            0
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn categories_are_independent() {
        let mut ledger = SubscriptionLedger::new();
        let request = CategorySymbols {
            trades: vec!["AAPL".to_string()],
            quotes: vec!["AAPL".to_string(), "MSFT".to_string()],
            bars: vec!["SPY".to_string()],
        };
        ledger.apply(SubscriptionAction::Subscribe, &request);
        ledger.apply(
            SubscriptionAction::Unsubscribe,
            &CategorySymbols {
                quotes: vec!["AAPL".to_string()],
                ..Default::default()
            },
        );

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.trades, vec!["AAPL"]);
        assert_eq!(snapshot.quotes, vec!["MSFT"]);
        assert_eq!(snapshot.bars, vec!["SPY"]);
    }

    #[test]
    fn restore_request_is_sorted_and_skips_empty_categories() {
        let mut ledger = SubscriptionLedger::new();
        ledger.apply(SubscriptionAction::Subscribe, &trades(&["MSFT", "AAPL"]));

        let request = ledger.restore_request().unwrap();
        assert_eq!(request.action, "subscribe");
        assert_eq!(request.trades, vec!["AAPL", "MSFT"]);
        assert!(request.quotes.is_empty());
        assert!(request.bars.is_empty());

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"action":"subscribe","trades":["AAPL","MSFT"]}"#);
    }

    #[test]
    fn route_or_queue_sends_when_accepted() {
        let mut ledger = SubscriptionLedger::new();
        let mut sent = Vec::new();

        let outcome = ledger.route_or_queue("first".to_string(), |raw| {
            sent.push(raw.to_string());
            true
        });

        assert_eq!(outcome, RouteOutcome::Sent);
        assert_eq!(sent, vec!["first"]);
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn route_or_queue_preserves_fifo_without_dedup() {
        let mut ledger = SubscriptionLedger::new();

        for raw in ["a", "b", "a"] {
            let outcome = ledger.route_or_queue(raw.to_string(), |_| false);
            assert_eq!(outcome, RouteOutcome::Queued);
        }

        assert_eq!(ledger.stats().pending, 3);
        assert_eq!(ledger.drain_pending(), vec!["a", "b", "a"]);
        assert_eq!(ledger.pending_len(), 0);
        assert!(ledger.drain_pending().is_empty());
    }

    #[test]
    fn category_symbols_from_client_request() {
        let request = ClientRequest {
            action: "subscribe".to_string(),
            trades: vec!["aapl".to_string()],
            quotes: vec![],
            bars: vec!["spy".to_string()],
        };
        let symbols = CategorySymbols::from(&request);
        assert_eq!(symbols.get(Category::Trades), ["aapl"]);
        assert!(symbols.get(Category::Quotes).is_empty());
        assert_eq!(symbols.get(Category::Bars), ["spy"]);
    }

    fn op_strategy() -> impl Strategy<Value = (bool, usize, Vec<String>)> {
        (
            any::<bool>(),
            0..3usize,
            prop::collection::vec("[a-dA-D]{1,2}", 0..4),
        )
    }

    proptest! {
        /// After any sequence of requests, a symbol is in a category's set
        /// exactly when the last request naming it there was a subscribe.
        #[test]
        fn ledger_matches_last_writer_union(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let mut ledger = SubscriptionLedger::new();
            let mut model: HashMap<(usize, String), bool> = HashMap::new();

            for (subscribe, category_idx, symbols) in &ops {
                let category = Category::all()[*category_idx];
                let mut request = CategorySymbols::default();
                match category {
                    Category::Trades => request.trades.clone_from(symbols),
                    Category::Quotes => request.quotes.clone_from(symbols),
                    Category::Bars => request.bars.clone_from(symbols),
                }
                let action = if *subscribe {
                    SubscriptionAction::Subscribe
                } else {
                    SubscriptionAction::Unsubscribe
                };
                ledger.apply(action, &request);

                for symbol in symbols {
                    model.insert((*category_idx, symbol.to_uppercase()), *subscribe);
                }
            }

            for (idx, category) in Category::all().iter().enumerate() {
                let mut expected: Vec<String> = model
                    .iter()
                    .filter(|((c, _), present)| *c == idx && **present)
                    .map(|((_, s), _)| s.clone())
                    .collect();
                expected.sort();
                prop_assert_eq!(ledger.symbols(*category), expected);
            }
        }
    }
}
