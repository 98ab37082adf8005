//! The maintenance worker: a dedicated thread driving the
//! flush / clean / shrink / delete cycle as the root slot advances.
//!
//! Keeping all four stages on one thread is what makes the lifecycle easy
//! to reason about: shrink's file-map swaps and clean's dead-byte
//! accounting never run concurrently for a file.

use {
    crate::accounts_db::AccountsDb,
    log::*,
    sable_metrics::datapoint_debug,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, sleep, Builder, JoinHandle},
        time::Duration,
    },
};

const MAINTENANCE_INTERVAL_MS: u64 = 100;

#[derive(Debug)]
pub struct AccountsBackgroundService {
    t_background: JoinHandle<()>,
}

impl AccountsBackgroundService {
    pub fn new(accounts_db: Arc<AccountsDb>, exit: Arc<AtomicBool>) -> Self {
        info!("AccountsBackgroundService active");
        let t_background = Builder::new()
            .name("sabBgAccounts".to_string())
            .spawn(move || loop {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                let flushed_slots = accounts_db.maintenance_iteration(&exit);
                if flushed_slots > 0 {
                    datapoint_debug!(
                        "accounts_background_service",
                        ("flushed_slots", flushed_slots, i64),
                    );
                } else {
                    sleep(Duration::from_millis(MAINTENANCE_INTERVAL_MS));
                }
            })
            .expect("spawn accounts background service");
        Self { t_background }
    }

    pub fn join(self) -> thread::Result<()> {
        self.t_background.join()
    }
}
