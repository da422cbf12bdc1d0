//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 開発用・テスト用の正本
//! - **BroadcastObserver**: tokio broadcast への push
//!
//! # 本番用実装
//! SQLite などの永続 store は別クレートに配置します。

pub mod broadcast;
pub mod inmem_store;

// 主要な型を再エクスポート
pub use self::broadcast::BroadcastObserver;
pub use self::inmem_store::InMemoryTaskStore;
