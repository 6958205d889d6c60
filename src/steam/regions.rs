use tracing::warn;

use super::models::Region;

// (country_code, currency_code, currency_symbol), in fetch order.
const DEFAULT_REGIONS: &[(&str, &str, &str)] = &[
    ("US", "USD", "$"),
    ("JP", "JPY", "¥"),
    ("GB", "GBP", "£"),
    ("EU", "EUR", "€"),
    ("CA", "CAD", "C$"),
    ("AU", "AUD", "A$"),
    ("RU", "RUB", "₽"),
    ("BR", "BRL", "R$"),
    ("KR", "KRW", "₩"),
    ("CN", "CNY", "¥"),
    ("IN", "INR", "₹"),
    ("TR", "TRY", "₺"),
    ("MX", "MXN", "Mex$"),
];

/// Regions fetched when the caller does not pick any.
pub const MINIMAL_REGION_CODES: &[&str] = &["US", "JP"];

/// The full curated region list.
pub fn default_regions() -> Vec<Region> {
    DEFAULT_REGIONS
        .iter()
        .map(|(cc, cur, sym)| Region::new(cc, cur, sym))
        .collect()
}

fn symbol_for_currency(code: &str) -> Option<&'static str> {
    DEFAULT_REGIONS
        .iter()
        .find(|(_, cur, _)| cur.eq_ignore_ascii_case(code))
        .map(|(_, _, sym)| *sym)
}

/// Pick the curated regions matching `codes`, keeping the caller's order.
/// Unknown codes are skipped; an empty result falls back to [`MINIMAL_REGION_CODES`].
pub fn select_regions(codes: &[String]) -> Vec<Region> {
    let all = default_regions();
    let mut picked: Vec<Region> = Vec::new();
    for code in codes {
        let code = code.trim().to_ascii_uppercase();
        match all.iter().find(|r| r.country_code == code) {
            Some(region) if !picked.contains(region) => picked.push(region.clone()),
            Some(_) => {}
            None => warn!(country = %code, "unknown region code; skipping"),
        }
    }
    if picked.is_empty() {
        if !codes.is_empty() {
            warn!("no valid regions specified, using default regions");
        }
        picked = all
            .into_iter()
            .filter(|r| MINIMAL_REGION_CODES.contains(&r.country_code.as_str()))
            .collect();
    }
    picked
}

/// Parse `"US:USD:$,GB:GBP"`-style region lists (symbol optional).
pub fn parse_regions(raw: &str) -> Vec<Region> {
    let mut out: Vec<Region> = Vec::new();
    for part in raw.split([',', ' ']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut fields = part.splitn(3, ':');
        let (Some(cc), Some(cur)) = (fields.next(), fields.next()) else {
            warn!(entry = %part, "ignoring region entry without currency");
            continue;
        };
        if cc.trim().is_empty() || cur.trim().is_empty() {
            continue;
        }
        let symbol = fields
            .next()
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .or_else(|| symbol_for_currency(cur.trim()).map(str::to_string))
            .unwrap_or_else(|| cur.trim().to_ascii_uppercase());
        let region = Region::new(cc, cur, &symbol);
        if out.iter().any(|r| r.country_code == region.country_code) {
            continue;
        }
        out.push(region);
    }
    out
}

/// Regions from `STEAM_REGIONS` when set and non-empty, else the curated list.
pub fn regions_from_env() -> Vec<Region> {
    if let Some(raw) = crate::util::env::env_opt("STEAM_REGIONS") {
        let parsed = parse_regions(&raw);
        if !parsed.is_empty() {
            return parsed;
        }
        warn!(value = %raw, "STEAM_REGIONS had no usable entries; using curated regions");
    }
    default_regions()
}
