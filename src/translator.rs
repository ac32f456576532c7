// src/translator.rs

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::SubscriberConfig;
use crate::models::{CopyOrder, TradeEvent};

/// Почему подписчик пропущен для события. Это не ошибка.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// lot_ratio = 0
    Disabled,
    /// volume * lot_ratio <= 0
    NonPositiveVolume,
    /// volume * lot_ratio не помещается в Decimal
    VolumeOverflow,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "subscriber disabled (lot_ratio = 0)"),
            SkipReason::NonPositiveVolume => write!(f, "scaled volume <= 0"),
            SkipReason::VolumeOverflow => write!(f, "scaled volume overflows"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Order(CopyOrder),
    Skip(SkipReason),
}

/// Переводит событие мастера в ордер подписчика. Чистая функция.
pub fn translate(event: &TradeEvent, sub: &SubscriberConfig) -> Translation {
    if sub.lot_ratio.is_zero() {
        return Translation::Skip(SkipReason::Disabled);
    }

    let Some(volume) = event.volume.checked_mul(sub.lot_ratio) else {
        return Translation::Skip(SkipReason::VolumeOverflow);
    };
    if volume <= Decimal::ZERO {
        return Translation::Skip(SkipReason::NonPositiveVolume);
    }

    let symbol = sub
        .symbol_map
        .get(&event.symbol)
        .cloned()
        .unwrap_or_else(|| event.symbol.clone());

    Translation::Order(CopyOrder {
        subscriber_id: sub.id.clone(),
        action: event.action.clone(),
        symbol,
        volume,
        price: event.price,
        correlation_id: correlation_id(&event.identity(), &sub.id),
    })
}

/// 32 hex-символа: первые 16 байт SHA-256(identity, 0x1f, subscriber_id)
pub fn correlation_id(identity: &str, subscriber_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update([0x1f]);
    hasher.update(subscriber_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
