// ===============================
// src/orderbook.rs
// ===============================
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::RwLock;

use rust_decimal::Decimal;

use crate::domain::Side;

/// Price-level book. Bids are keyed by `Reverse` so both sides iterate best-first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    pub ts: i64,
}

impl OrderBook {
    pub fn from_levels(asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)], ts: i64) -> Self {
        let mut book = OrderBook { ts, ..Default::default() };
        for &(p, s) in bids {
            if s > Decimal::ZERO {
                book.bids.insert(Reverse(p), s);
            }
        }
        for &(p, s) in asks {
            if s > Decimal::ZERO {
                book.asks.insert(p, s);
            }
        }
        // a crossed snapshot keeps the bid side and drops crossing asks
        if let Some((bid, _)) = book.best_bid() {
            book.asks.retain(|p, _| *p > bid);
        }
        book
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next().map(|(p, s)| (p.0, *s))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, s)| (*p, *s))
    }

    pub fn best(&self, side: Side) -> Option<(Decimal, Decimal)> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    /// Absolute size at a level; zero removes it. Opposite levels the update
    /// would cross are pruned.
    pub fn update_level(&mut self, side: Side, price: Decimal, size: Decimal) {
        match side {
            Side::Buy => {
                if size <= Decimal::ZERO {
                    self.bids.remove(&Reverse(price));
                } else {
                    self.bids.insert(Reverse(price), size);
                    self.asks.retain(|p, _| *p > price);
                }
            }
            Side::Sell => {
                if size <= Decimal::ZERO {
                    self.asks.remove(&price);
                } else {
                    self.asks.insert(price, size);
                    self.bids.retain(|p, _| p.0 < price);
                }
            }
        }
    }

    pub fn bids(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.bids.iter().map(|(p, s)| (p.0, *s))
    }

    pub fn asks(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.asks.iter().map(|(p, s)| (*p, *s))
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.asks.len(), self.bids.len())
    }
}

/// One mirror per market. Writers replace or patch under the write lock,
/// readers copy out.
#[derive(Debug, Default)]
pub struct OrderBookMirror {
    book: RwLock<OrderBook>,
}

impl OrderBookMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full replacement, atomic for readers.
    pub fn rebuild(&self, asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)], ts: i64) {
        let next = OrderBook::from_levels(asks, bids, ts);
        *self.book.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn update_level(&self, side: Side, price: Decimal, size: Decimal, ts: i64) {
        let mut book = self.book.write().unwrap_or_else(|e| e.into_inner());
        book.update_level(side, price, size);
        book.ts = book.ts.max(ts);
    }

    pub fn best(&self, side: Side) -> Option<(Decimal, Decimal)> {
        self.book.read().unwrap_or_else(|e| e.into_inner()).best(side)
    }

    pub fn best_bid_ask(&self) -> (Option<Decimal>, Option<Decimal>) {
        let book = self.book.read().unwrap_or_else(|e| e.into_inner());
        (book.best_bid().map(|l| l.0), book.best_ask().map(|l| l.0))
    }

    pub fn last_update(&self) -> i64 {
        self.book.read().unwrap_or_else(|e| e.into_inner()).ts
    }

    pub fn snapshot(&self) -> OrderBook {
        self.book.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Asks top-down then bids, `top_n` levels each side.
    pub fn render_string(&self, top_n: usize) -> String {
        let book = self.snapshot();
        let mut out = String::new();
        let asks: Vec<_> = book.asks().take(top_n).collect();
        for (p, s) in asks.iter().rev() {
            let _ = writeln!(out, "  ask {:>14} {:>14}", p.normalize(), s.normalize());
        }
        out.push_str("  ----\n");
        for (p, s) in book.bids().take(top_n) {
            let _ = writeln!(out, "  bid {:>14} {:>14}", p.normalize(), s.normalize());
        }
        out
    }
}
