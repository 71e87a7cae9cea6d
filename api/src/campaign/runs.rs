//! 即時送信ループの実行権。
//!
//! ループを起動するたびにキャンペーンごとの世代を進める。古い世代のループは次の確認で抜け、
//! 新しいループは古いループが抜けるまで待ってから `pending` を読み直す。
//! 管理はプロセス内なので、送信ループを動かすプロセスは1つに限る。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as RunLock, OwnedMutexGuard};

use crate::types::CampaignId;

struct Slot {
    generation: u64,
    lock: Arc<RunLock<()>>,
}

#[derive(Clone, Default)]
pub struct CampaignRuns {
    slots: Arc<Mutex<HashMap<CampaignId, Slot>>>,
}

impl CampaignRuns {
    fn slots(&self) -> MutexGuard<'_, HashMap<CampaignId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 新しい世代を発行する。この時点で以前の世代はすべて古くなる。
    pub fn issue(&self, campaign_id: &CampaignId) -> RunTicket {
        let mut slots = self.slots();
        let slot = slots.entry(campaign_id.clone()).or_insert_with(|| Slot {
            generation: 0,
            lock: Arc::default(),
        });
        slot.generation += 1;
        RunTicket {
            runs: self.clone(),
            campaign_id: campaign_id.clone(),
            generation: slot.generation,
            lock: slot.lock.clone(),
        }
    }

    fn is_current(&self, campaign_id: &CampaignId, generation: u64) -> bool {
        self.slots()
            .get(campaign_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// 実行中か、実行を待っているループがあるか
    pub fn is_tracked(&self, campaign_id: &CampaignId) -> bool {
        self.slots().contains_key(campaign_id)
    }
}

/// 発行済みでまだ実行権を得ていない世代
pub struct RunTicket {
    runs: CampaignRuns,
    campaign_id: CampaignId,
    generation: u64,
    lock: Arc<RunLock<()>>,
}

impl RunTicket {
    /// 同じキャンペーンの前のループが抜けるまで待つ
    pub async fn acquire(self) -> RunLease {
        let guard = self.lock.clone().lock_owned().await;
        RunLease {
            runs: self.runs,
            campaign_id: self.campaign_id,
            generation: self.generation,
            _guard: guard,
        }
    }
}

pub struct RunLease {
    runs: CampaignRuns,
    campaign_id: CampaignId,
    generation: u64,
    _guard: OwnedMutexGuard<()>,
}

impl RunLease {
    /// 後から発行された世代がなければ true
    pub fn is_current(&self) -> bool {
        self.runs.is_current(&self.campaign_id, self.generation)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let mut slots = self.runs.slots();
        if slots
            .get(&self.campaign_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.campaign_id);
        }
    }
}
