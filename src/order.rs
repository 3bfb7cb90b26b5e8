// ===============================
// src/order.rs
// ===============================
//
// One engine per order. Push frames, REST polls and call responses are all
// `OrderSnapshot`s folded through `apply`, which keeps the order monotone in
// (update_time, filled) and derives the deals between observations.
//
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{now_ms, Deal, OrderSnapshot, OrderStatus, Side, SnapshotSource};
use crate::error::{lock, ErrorReporter, VenueError, VenueResult};
use crate::instruments::{floor_to, InstrumentRegistry};
use crate::metrics::{DEALS, ORDERS_CREATED, ORDERS_FINISHED};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub client_id: String,
    /// Canonical instrument id.
    pub instrument: String,
    /// Venue symbol.
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub post_only: bool,
    pub reduce_only: bool,
    pub purpose: String,
}

/// Everything a venue needs to address an existing order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRef {
    pub client_id: String,
    pub venue_id: Option<String>,
    pub symbol: String,
    pub instrument: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceAck {
    pub venue_id: Option<String>,
    pub client_id: Option<String>,
    /// Some venues answer with a full order object.
    pub snapshot: Option<OrderSnapshot>,
}

/// Order entry surface of a venue.
#[async_trait]
pub trait OrderVenue: Send + Sync {
    fn venue_name(&self) -> &str;

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<PlaceAck>;

    async fn cancel_order(&self, order: &OrderRef) -> VenueResult<Option<OrderSnapshot>>;

    async fn query_order(&self, order: &OrderRef) -> VenueResult<OrderSnapshot>;

    fn supports_modify(&self) -> bool {
        false
    }

    async fn modify_order(
        &self,
        _order: &OrderRef,
        _price: Decimal,
        _size: Decimal,
    ) -> VenueResult<Option<OrderSnapshot>> {
        Err(VenueError::InvalidRequest(format!("{} does not support modify", self.venue_name())))
    }

    /// Cancel races on an order that is already terminal.
    fn is_benign_cancel_error(&self, _err: &VenueError) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderState {
    pub client_id: String,
    pub venue_id: Option<String>,
    pub instrument: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub status: OrderStatus,
    pub update_time: i64,
    pub finished: bool,
    pub fatal_error: Option<String>,
    pub post_only: bool,
    pub reduce_only: bool,
    pub purpose: String,
    /// A venue id is known, or a snapshot carried our client id.
    pub created: bool,
    pub local_created_at: i64,
    // sum(price * amount) over emitted deals
    notional: Decimal,
}

impl OrderState {
    fn from_request(req: &OrderRequest) -> Self {
        Self {
            client_id: req.client_id.clone(),
            venue_id: None,
            instrument: req.instrument.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            price: req.price,
            size: req.size,
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            status: OrderStatus::New,
            update_time: 0,
            finished: false,
            fatal_error: None,
            post_only: req.post_only,
            reduce_only: req.reduce_only,
            purpose: req.purpose.clone(),
            created: false,
            local_created_at: now_ms(),
            notional: Decimal::ZERO,
        }
    }

    pub fn remaining(&self) -> Decimal {
        (self.size - self.filled).max(Decimal::ZERO)
    }

    pub fn order_ref(&self) -> OrderRef {
        OrderRef {
            client_id: self.client_id.clone(),
            venue_id: self.venue_id.clone(),
            symbol: self.symbol.clone(),
            instrument: self.instrument.clone(),
        }
    }

    fn is_duplicate(&self, snap: &OrderSnapshot) -> bool {
        snap.update_time == self.update_time
            && snap.filled == self.filled
            && snap.status == self.status
            && snap.price.map_or(true, |p| p == self.price)
            && snap.size.map_or(true, |s| s == self.size)
            && (snap.venue_id.is_none() || snap.venue_id == self.venue_id)
    }

    /// Fold one observation in. `None` means it was dropped. Does not set
    /// `finished`; the caller does that after observers saw the deals.
    fn reconcile(&mut self, snap: &OrderSnapshot, local_time: i64) -> Option<Vec<Deal>> {
        if self.finished || snap.update_time < self.update_time || snap.filled < self.filled {
            return None;
        }
        if self.is_duplicate(snap) {
            return None;
        }

        let resting = snap.price.filter(|p| *p > Decimal::ZERO).unwrap_or(self.price);
        let delta = snap.filled - self.filled;
        let mut fills: Vec<(Decimal, Decimal)> = Vec::new();

        if delta > Decimal::ZERO {
            match snap.last_fill {
                Some((px, sz)) if px > Decimal::ZERO && sz > Decimal::ZERO => {
                    let last = sz.min(delta);
                    let gap = delta - last;
                    if gap > Decimal::ZERO {
                        // an earlier fill was missed; rebuild it from the totals
                        let mut gap_px = if snap.avg_price > Decimal::ZERO {
                            (snap.filled * snap.avg_price - self.notional - px * last) / gap
                        } else {
                            resting
                        };
                        if gap_px <= Decimal::ZERO {
                            gap_px = resting;
                        }
                        fills.push((gap_px, gap));
                    }
                    fills.push((px, last));
                }
                _ => {
                    let px = if snap.avg_price > Decimal::ZERO {
                        (snap.filled * snap.avg_price - self.notional) / delta
                    } else {
                        resting
                    };
                    fills.push((if px > Decimal::ZERO { px } else { resting }, delta));
                }
            }
        }

        let deals = fills
            .into_iter()
            .map(|(price, amount)| {
                self.notional += price * amount;
                Deal {
                    client_id: self.client_id.clone(),
                    venue_id: snap.venue_id.clone().or_else(|| self.venue_id.clone()),
                    instrument: self.instrument.clone(),
                    side: self.side,
                    price,
                    amount,
                    venue_time: snap.update_time,
                    local_time,
                }
            })
            .collect();

        if let Some(id) = &snap.venue_id {
            self.venue_id = Some(id.clone());
        }
        if let Some(p) = snap.price.filter(|p| *p > Decimal::ZERO) {
            self.price = p;
        }
        if let Some(s) = snap.size.filter(|s| *s > Decimal::ZERO) {
            self.size = s;
        }
        self.filled = snap.filled;
        if self.filled > self.size {
            warn!(client_id = %self.client_id, filled = %self.filled, size = %self.size, "filled above size, size raised");
            self.size = self.filled;
        }
        if snap.avg_price > Decimal::ZERO {
            self.avg_price = snap.avg_price;
        } else if self.filled > Decimal::ZERO {
            self.avg_price = self.notional / self.filled;
        }
        self.status = match snap.status {
            OrderStatus::New if self.filled > Decimal::ZERO => OrderStatus::Partial,
            s => s,
        };
        self.update_time = snap.update_time;
        self.created = true;
        Some(deals)
    }
}

/// Order callbacks. Both run outside the order's state lock, in order:
/// every deal of an observation, then one update.
pub trait OrderObserver: Send + Sync {
    fn on_deal(&self, _order: &OrderState, _deal: &Deal) {}
    fn on_update(&self, _order: &OrderState) {}
}

#[derive(Debug, Clone)]
pub struct OrderEngineConfig {
    pub poll_interval: Duration,
    /// Consecutive business errors on poll before the order is given up.
    pub poll_fatal_after: u32,
}

impl Default for OrderEngineConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(10), poll_fatal_after: 3 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModifyOutcome {
    Modified { price: Decimal, size: Decimal },
    /// The new size was under the minimum, so the order is being canceled.
    Canceled,
}

pub struct OrderEngine {
    venue: Arc<dyn OrderVenue>,
    registry: Arc<InstrumentRegistry>,
    cfg: OrderEngineConfig,
    request: OrderRequest,
    reporter: Arc<ErrorReporter>,
    state: Mutex<OrderState>,
    // serialises apply + callbacks so deals stay ordered
    apply_lock: Mutex<()>,
    observers: Mutex<Vec<Arc<dyn OrderObserver>>>,
    cancel_in_flight: AtomicBool,
    cancel_deferred: AtomicBool,
    poll_errors: AtomicU32,
    wake: Notify,
    finished_tx: watch::Sender<bool>,
}

impl OrderEngine {
    pub fn new(
        request: OrderRequest,
        venue: Arc<dyn OrderVenue>,
        registry: Arc<InstrumentRegistry>,
        cfg: OrderEngineConfig,
        reporter: Arc<ErrorReporter>,
    ) -> Arc<Self> {
        let (finished_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(OrderState::from_request(&request)),
            venue,
            registry,
            cfg,
            request,
            reporter,
            apply_lock: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
            cancel_in_flight: AtomicBool::new(false),
            cancel_deferred: AtomicBool::new(false),
            poll_errors: AtomicU32::new(0),
            wake: Notify::new(),
            finished_tx,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.request.client_id
    }

    pub fn request(&self) -> &OrderRequest {
        &self.request
    }

    pub fn state(&self) -> OrderState {
        lock(&self.state).clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.state).finished
    }

    pub fn add_observer(&self, obs: Arc<dyn OrderObserver>) {
        lock(&self.observers).push(obs);
    }

    fn order_ref(&self) -> OrderRef {
        lock(&self.state).order_ref()
    }

    fn observers(&self) -> Vec<Arc<dyn OrderObserver>> {
        lock(&self.observers).clone()
    }

    /// Reconcile one observation. Returns false when it was dropped.
    pub fn apply(&self, snap: &OrderSnapshot) -> bool {
        let _serial = lock(&self.apply_lock);
        let local_time = now_ms();

        let (deals, view) = {
            let mut st = lock(&self.state);
            match st.reconcile(snap, local_time) {
                Some(deals) => (deals, st.clone()),
                None => {
                    debug!(
                        client_id = %st.client_id,
                        ts = snap.update_time,
                        filled = %snap.filled,
                        source = ?snap.source,
                        "snapshot dropped"
                    );
                    return false;
                }
            }
        };

        let observers = self.observers();
        for deal in &deals {
            DEALS.with_label_values(&[&deal.instrument]).inc();
            info!(
                client_id = %deal.client_id,
                side = deal.side.as_str(),
                price = %deal.price,
                amount = %deal.amount,
                "deal"
            );
            for obs in &observers {
                obs.on_deal(&view, deal);
            }
        }
        for obs in &observers {
            obs.on_update(&view);
        }

        if view.status.is_terminal() {
            self.finish(view.status);
        }
        true
    }

    fn finish(&self, status: OrderStatus) {
        let mut st = lock(&self.state);
        if st.finished {
            return;
        }
        st.finished = true;
        drop(st);
        ORDERS_FINISHED.with_label_values(&[status.label()]).inc();
        let _ = self.finished_tx.send(true);
        self.wake.notify_one();
    }

    /// Give up on the order: status `Rejected`, `fatal_error` set, finished.
    pub fn mark_fatal(&self, msg: impl Into<String>) {
        let _serial = lock(&self.apply_lock);
        let view = {
            let mut st = lock(&self.state);
            if st.finished {
                return;
            }
            st.status = OrderStatus::Rejected;
            st.fatal_error = Some(msg.into());
            st.clone()
        };
        warn!(client_id = %view.client_id, error = ?view.fatal_error, "order failed");
        for obs in self.observers() {
            obs.on_update(&view);
        }
        self.finish(OrderStatus::Rejected);
    }

    /// Submit the order. A transport error leaves the outcome to polling.
    pub async fn create(&self) -> VenueResult<()> {
        ORDERS_CREATED.with_label_values(&[&self.request.instrument]).inc();
        match self.venue.place_order(&self.request).await {
            Ok(ack) => {
                {
                    let mut st = lock(&self.state);
                    if ack.venue_id.is_some() {
                        st.venue_id = ack.venue_id.clone();
                    }
                    st.created = true;
                }
                info!(client_id = %self.request.client_id, venue_id = ?ack.venue_id, "order created");
                if let Some(snap) = ack.snapshot {
                    self.apply(&snap.from_source(SnapshotSource::Response));
                }
                Ok(())
            }
            Err(e) if e.is_business() => {
                self.reporter.report("place_order", &e);
                self.mark_fatal(e.to_string());
                Err(e)
            }
            Err(e) => {
                self.reporter.report("place_order", &e);
                warn!(client_id = %self.request.client_id, error = %e, "create outcome unknown, will poll");
                Err(e)
            }
        }
    }

    /// Request cancellation. Concurrent calls coalesce into one venue call;
    /// before creation the cancel is deferred to the driver.
    pub async fn cancel(&self) -> VenueResult<()> {
        let created = {
            let st = lock(&self.state);
            if st.finished {
                return Ok(());
            }
            st.created
        };
        if !created {
            debug!(client_id = %self.request.client_id, "cancel deferred until created");
            self.cancel_deferred.store(true, Ordering::SeqCst);
            self.wake.notify_one();
            return Ok(());
        }
        if self.cancel_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = self.venue.cancel_order(&self.order_ref()).await;
        self.cancel_in_flight.store(false, Ordering::SeqCst);
        match res {
            Ok(Some(snap)) => {
                self.apply(&snap.from_source(SnapshotSource::Response));
                Ok(())
            }
            Ok(None) => {
                self.request_poll();
                Ok(())
            }
            Err(e) if self.venue.is_benign_cancel_error(&e) => {
                debug!(client_id = %self.request.client_id, error = %e, "cancel raced a terminal order");
                self.request_poll();
                Ok(())
            }
            Err(e) => {
                self.reporter.report("cancel_order", &e);
                Err(e)
            }
        }
    }

    /// Amend price and size. A size under the minimum (or not above what is
    /// already filled) becomes a cancel.
    pub async fn modify(&self, price: Decimal, size: Decimal) -> VenueResult<ModifyOutcome> {
        if !self.venue.supports_modify() {
            return Err(VenueError::InvalidRequest(format!("{} cannot modify orders", self.venue.venue_name())));
        }
        let (side, post_only, filled, finished) = {
            let st = lock(&self.state);
            (st.side, st.post_only, st.filled, st.finished)
        };
        if finished {
            return Err(VenueError::InvalidRequest(format!("order {} is finished", self.request.client_id)));
        }
        let inst = self
            .registry
            .get(&self.request.instrument)
            .ok_or_else(|| VenueError::InvalidRequest(format!("unknown instrument {}", self.request.instrument)))?;
        let px = inst.align_price(price, side, post_only, None, None);
        let sz = floor_to(size, inst.lot_size);
        if sz < inst.min_size_at(px) || sz <= filled {
            info!(client_id = %self.request.client_id, %sz, %filled, "modify below minimum, canceling");
            self.cancel().await?;
            return Ok(ModifyOutcome::Canceled);
        }

        let res = self.venue.modify_order(&self.order_ref(), px, sz).await;
        match res {
            Ok(snap) => {
                {
                    // the venue may only confirm on a later frame
                    let mut st = lock(&self.state);
                    if !st.finished {
                        st.price = px;
                        st.size = sz;
                    }
                }
                if let Some(snap) = snap {
                    self.apply(&snap.from_source(SnapshotSource::Response));
                }
                Ok(ModifyOutcome::Modified { price: px, size: sz })
            }
            Err(e) => {
                self.reporter.report("modify_order", &e);
                Err(e)
            }
        }
    }

    /// One REST query folded through `apply`.
    pub async fn poll(&self) -> VenueResult<()> {
        if self.is_finished() {
            return Ok(());
        }
        match self.venue.query_order(&self.order_ref()).await {
            Ok(snap) => {
                self.poll_errors.store(0, Ordering::SeqCst);
                self.apply(&snap.from_source(SnapshotSource::Poll));
                Ok(())
            }
            Err(e) if e.is_business() => {
                let n = self.poll_errors.fetch_add(1, Ordering::SeqCst) + 1;
                self.reporter.report("query_order", &e);
                if n >= self.cfg.poll_fatal_after {
                    self.mark_fatal(format!("query failed {n} times: {e}"));
                }
                Err(e)
            }
            Err(e) => {
                self.reporter.report("query_order", &e);
                Err(e)
            }
        }
    }

    /// Poll at the next opportunity instead of waiting for the timer.
    pub fn request_poll(&self) {
        self.wake.notify_one();
    }

    pub async fn wait_finished(&self, within: Duration) -> bool {
        let mut rx = self.finished_tx.subscribe();
        tokio::time::timeout(within, rx.wait_for(|done| *done)).await.map_or(false, |r| r.is_ok())
    }

    /// Spawn the driver: create, then poll until terminal.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move { me.run().await })
    }

    async fn run(self: Arc<Self>) {
        let _ = self.create().await;
        let mut finished_rx = self.finished_tx.subscribe();
        loop {
            if self.is_finished() {
                break;
            }
            let created = lock(&self.state).created;
            if created && self.cancel_deferred.swap(false, Ordering::SeqCst) {
                let _ = self.cancel().await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = self.wake.notified() => {}
                _ = finished_rx.changed() => {}
            }
            if self.is_finished() {
                break;
            }
            let _ = self.poll().await;
        }
        debug!(client_id = %self.request.client_id, "order driver exit");
    }
}

#[derive(Default)]
struct IndexInner {
    by_client: HashMap<String, Arc<OrderEngine>>,
    venue_to_client: HashMap<String, String>,
}

/// Live orders of one venue, addressable by client id or venue id.
#[derive(Default)]
pub struct OrderIndex {
    inner: Mutex<IndexInner>,
}

impl OrderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, engine: Arc<OrderEngine>) {
        let mut inner = lock(&self.inner);
        if let Some(vid) = engine.state().venue_id {
            inner.venue_to_client.insert(vid, engine.client_id().to_string());
        }
        inner.by_client.insert(engine.client_id().to_string(), engine);
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<OrderEngine>> {
        lock(&self.inner).by_client.get(client_id).cloned()
    }

    fn find(&self, snap: &OrderSnapshot) -> Option<Arc<OrderEngine>> {
        let mut inner = lock(&self.inner);
        let by_client = snap.client_id.as_ref().and_then(|c| inner.by_client.get(c)).cloned();
        let engine = match by_client {
            Some(e) => e,
            None => {
                let vid = snap.venue_id.as_ref()?;
                let cid = inner.venue_to_client.get(vid)?.clone();
                inner.by_client.get(&cid).cloned()?
            }
        };
        if let Some(vid) = &snap.venue_id {
            inner.venue_to_client.insert(vid.clone(), engine.client_id().to_string());
        }
        Some(engine)
    }

    /// Deliver a pushed snapshot. False when no live order matches.
    pub fn route(&self, snap: &OrderSnapshot) -> bool {
        match self.find(snap) {
            Some(engine) => {
                engine.apply(snap);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<OrderEngine>> {
        let mut inner = lock(&self.inner);
        let engine = inner.by_client.remove(client_id)?;
        inner.venue_to_client.retain(|_, c| c != client_id);
        Some(engine)
    }

    pub fn all(&self) -> Vec<Arc<OrderEngine>> {
        lock(&self.inner).by_client.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every live order to poll, e.g. after the push stream reconnected.
    pub fn poll_all(&self) {
        for e in self.all() {
            e.request_poll();
        }
    }
}
