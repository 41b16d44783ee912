//! Observability - tracing subscriber の初期化
//!
//! フィルタは `RUST_LOG` を優先し、無ければ引数の既定値を使う。
//! 二回目以降の呼び出しは何もしない (テストから何度呼んでも安全)。

use tracing_subscriber::EnvFilter;

/// `info` を既定レベルとして fmt subscriber を登録する。
pub fn init_tracing() {
    init_tracing_with("info");
}

pub fn init_tracing_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
