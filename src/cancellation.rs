//! Navigation epochs. Navigating away from a page cancels the token shared
//! by that page's running passes and bumps its epoch number, so a pass can
//! tell at the end whether its result may still be applied.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

struct Epoch {
    number: u64,
    token: CancellationToken,
}

pub struct TaskGeneration {
    epoch: Arc<RwLock<Epoch>>,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self {
            epoch: Arc::new(RwLock::new(Epoch {
                number: 0,
                token: CancellationToken::new(),
            })),
        }
    }

    /// Cancel every outstanding guard and open a new epoch. Returns its number.
    pub fn advance(&self) -> u64 {
        let mut epoch = self.epoch.write();
        epoch.token.cancel();
        epoch.token = CancellationToken::new();
        epoch.number += 1;
        epoch.number
    }

    /// Guard bound to the current epoch.
    pub fn guard(&self) -> GenerationGuard {
        let epoch = self.epoch.read();
        GenerationGuard {
            epoch: Arc::clone(&self.epoch),
            my_generation: epoch.number,
            token: epoch.token.child_token(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.epoch.read().number
    }
}

impl Default for TaskGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// One `TaskGeneration` per page with running or finished passes.
/// Navigation only cancels pages other than the destination.
#[derive(Default)]
pub struct PageGenerations {
    pages: Mutex<HashMap<String, TaskGeneration>>,
}

impl PageGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self, page_path: &str) -> GenerationGuard {
        self.pages
            .lock()
            .entry(page_path.to_string())
            .or_default()
            .guard()
    }

    /// Cancel passes of every page except `destination`. Returns how many
    /// pages were left behind. Their entries are dropped: outstanding guards
    /// keep the advanced epoch alive, and later guards start a fresh one.
    pub fn navigate_to(&self, destination: &str) -> usize {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|page, generation| {
            if page == destination {
                return true;
            }
            generation.advance();
            false
        });
        before - pages.len()
    }
}

/// Held by a page pass for its whole run.
#[derive(Clone)]
pub struct GenerationGuard {
    epoch: Arc<RwLock<Epoch>>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    /// No navigation happened since the guard was taken.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.epoch.read().number == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
