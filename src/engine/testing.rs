// Shared fakes for engine tests: a controllable segmenter, ledger, and
// result store.

use anyhow::Result;
use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, Sender};
use image::{DynamicImage, GrayImage, Luma};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::errors::{LedgerError, LedgerResult};
use crate::core::types::{ItemId, Quality};
use crate::services::ledger::UsageGate;
use crate::services::segmentation::{Segmenter, SegmenterProvider};
use crate::services::store::{ResultStore, StoreRequest};

/// Images prepared at this width make the fake segmenter fail.
pub(crate) const FAIL_WIDTH: u32 = 13;

/// Segmenter provider whose models finish instantly, or block until the test
/// releases them one token at a time.
pub(crate) struct FakeProvider {
    pub loads: AtomicUsize,
    hold: Option<(Sender<()>, Receiver<()>)>,
}

impl FakeProvider {
    pub fn instant() -> Self {
        Self {
            loads: AtomicUsize::new(0),
            hold: None,
        }
    }

    pub fn held() -> Self {
        Self {
            loads: AtomicUsize::new(0),
            hold: Some(unbounded()),
        }
    }

    /// Allow `n` held inference calls to finish.
    pub fn release(&self, n: usize) {
        if let Some((tx, _)) = &self.hold {
            for _ in 0..n {
                tx.send(()).expect("fake segmenter gone");
            }
        }
    }
}

impl SegmenterProvider for FakeProvider {
    fn load(&self, _quality: Quality) -> Result<Box<dyn Segmenter>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSegmenter {
            hold: self.hold.as_ref().map(|(_, rx)| rx.clone()),
        }))
    }
}

struct FakeSegmenter {
    hold: Option<Receiver<()>>,
}

impl Segmenter for FakeSegmenter {
    fn segment(&mut self, image: &DynamicImage) -> Result<GrayImage> {
        if let Some(rx) = &self.hold {
            let _ = rx.recv();
        }
        if image.width() == FAIL_WIDTH {
            anyhow::bail!("synthetic inference failure");
        }
        Ok(GrayImage::from_pixel(
            image.width(),
            image.height(),
            Luma([255u8]),
        ))
    }
}

/// In-memory ledger with a deductible balance.
pub(crate) struct TestGate {
    balance: Mutex<u32>,
    fail: bool,
}

impl TestGate {
    pub fn with_balance(credits: u32) -> Self {
        Self {
            balance: Mutex::new(credits),
            fail: false,
        }
    }

    /// A gate whose calls fail for non-affordability reasons.
    pub fn failing() -> Self {
        Self {
            balance: Mutex::new(0),
            fail: true,
        }
    }

    pub fn balance_now(&self) -> u32 {
        *self.balance.lock()
    }
}

#[async_trait]
impl UsageGate for TestGate {
    async fn check_and_reserve(&self, cost: u32, _feature: &str) -> LedgerResult<()> {
        if self.fail {
            return Err(LedgerError::Request("ledger offline".into()));
        }
        let mut balance = self.balance.lock();
        if cost > *balance {
            return Err(LedgerError::InsufficientBalance { required: cost });
        }
        *balance -= cost;
        Ok(())
    }

    async fn balance(&self) -> LedgerResult<u32> {
        Ok(*self.balance.lock())
    }
}

/// Result store that remembers which items it saw.
#[derive(Default)]
pub(crate) struct RecordingStore {
    stored: Mutex<Vec<ItemId>>,
}

impl RecordingStore {
    pub fn stored_count(&self) -> usize {
        self.stored.lock().len()
    }
}

#[async_trait]
impl ResultStore for RecordingStore {
    async fn store(&self, request: StoreRequest) -> Result<()> {
        self.stored.lock().push(request.item_id);
        Ok(())
    }
}
