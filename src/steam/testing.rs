//! Test doubles shared by the unit tests of the steam modules.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{StoreTransport, TransportError};
use super::models::{EntryPriceProfile, PriceOverview, Region, RegionPriceRecord};

/// Transport answering every call through a closure and counting calls.
pub struct FnTransport<F> {
    respond: F,
    calls: AtomicUsize,
}

impl<F> FnTransport<F>
where
    F: Fn(&str, &[(&str, &str)]) -> Result<Value, TransportError> + Send + Sync,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> StoreTransport for FnTransport<F>
where
    F: Fn(&str, &[(&str, &str)]) -> Result<Value, TransportError> + Send + Sync,
{
    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(url, query)
    }
}

pub fn query_value<'a>(query: &'a [(&str, &str)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// appdetails body carrying a price_overview for `app_id`.
pub fn price_body(app_id: &str, initial: i64, final_price: i64, discount: i64) -> Value {
    let entry = json!({
        "success": true,
        "data": {
            "price_overview": {
                "currency": "USD",
                "initial": initial,
                "final": final_price,
                "discount_percent": discount,
                "initial_formatted": "",
                "final_formatted": format!("{:.2}", final_price as f64 / 100.0),
            }
        }
    });
    wrap(app_id, entry)
}

/// `{"<app_id>": entry}`, the shape of every appdetails body.
pub fn wrap(app_id: &str, entry: Value) -> Value {
    let mut body = serde_json::Map::new();
    body.insert(app_id.to_string(), entry);
    Value::Object(body)
}

pub fn priced_profile(name: &str, cc: &str, final_minor: i64) -> EntryPriceProfile {
    let overview: PriceOverview = serde_json::from_value(json!({
        "initial": final_minor,
        "final": final_minor,
        "discount_percent": 0,
        "final_formatted": format!("${:.2}", final_minor as f64 / 100.0),
    }))
    .expect("valid overview fixture");
    let mut p = EntryPriceProfile::new(name);
    p.insert_region(
        cc,
        RegionPriceRecord::from_overview(&Region::new(cc, "USD", "$"), &overview),
    );
    p
}
