//! IdGenerator port - envelope id / Queue message id の生成
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 乱数で ULID を作る

use ulid::Ulid;

use crate::ports::Clock;

/// 複数の procedure loop から同時に呼ばれるため `Send + Sync`
pub trait IdGenerator: Send + Sync {
    /// 送信ごとに新しい envelope id
    fn envelope_id(&self) -> String;

    /// Queue の `message-id` (呼び出し側が指定しなかった場合)
    fn message_id(&self) -> String;
}

/// timestamp 部分は Clock 由来なので、FixedClock を渡すと時刻部分が固定される
#[derive(Debug, Clone)]
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn envelope_id(&self) -> String {
        self.next().to_string()
    }

    fn message_id(&self) -> String {
        self.next().to_string()
    }
}
