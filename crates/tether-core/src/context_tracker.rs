use tokio::sync::Mutex;

use tether_types::{ContextBreakdown, ContextCategory, UsageStats};

/// Tracks how full the session's context window is. Coarse updates come from
/// result usage counters; detailed ones from a parsed context probe replay.
pub struct ContextTracker {
    current: Mutex<ContextBreakdown>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(ContextBreakdown::default()),
        }
    }

    pub async fn current(&self) -> ContextBreakdown {
        self.current.lock().await.clone()
    }

    /// Best-effort update from a turn's usage counters. The window size is
    /// only known from detailed reports, so an earlier one is kept.
    pub async fn update_from_usage(&self, usage: &UsageStats, model: Option<&str>) {
        let mut current = self.current.lock().await;
        current.used_tokens =
            usage.input_tokens + usage.cache_read_input_tokens + usage.cache_creation_input_tokens;
        if let Some(model) = model {
            current.model = Some(model.to_string());
        }
        current.recompute_percentage();
    }

    pub async fn update_with_detailed_breakdown(&self, breakdown: ContextBreakdown) {
        let mut current = self.current.lock().await;
        *current = breakdown;
        current.recompute_percentage();
    }
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_token_count(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed
        .strip_suffix('k')
        .or_else(|| trimmed.strip_suffix('K'))
    {
        let value: f64 = stripped.trim().parse().ok()?;
        return Some((value * 1000.0) as u64);
    }
    trimmed.replace(',', "").parse().ok()
}

fn parse_totals_line(line: &str) -> Option<(u64, u64, Option<String>)> {
    let (model_part, rest) = match line.split_once('•') {
        Some((model, rest)) => {
            let model = model.trim();
            let model = (!model.is_empty()).then(|| model.to_string());
            (model, rest.trim())
        }
        None => (None, line),
    };
    if !rest.contains("tokens") {
        return None;
    }
    let slash_part = rest.split_whitespace().find(|part| part.contains('/'))?;
    let (used_raw, max_raw) = slash_part.split_once('/')?;
    let used = parse_token_count(used_raw)?;
    let max = parse_token_count(max_raw)?;
    Some((used, max, model_part))
}

fn parse_category_line(line: &str) -> Option<(String, u64)> {
    let (name, rest) = line.split_once(':')?;
    let rest = rest.trim();
    if !rest.contains("tokens") {
        return None;
    }
    let first = rest.split_whitespace().next()?;
    let tokens = parse_token_count(first)?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), tokens))
}

/// Parses the plain-text context report emitted in response to the context
/// probe. Returns None when no totals line is present, which callers treat
/// as "not a context report".
pub fn parse_context_report(text: &str) -> Option<ContextBreakdown> {
    let mut breakdown = ContextBreakdown::default();
    let mut saw_totals = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !saw_totals {
            if let Some((used, max, model)) = parse_totals_line(line) {
                breakdown.used_tokens = used;
                breakdown.max_tokens = max;
                breakdown.model = model;
                saw_totals = true;
            }
            continue;
        }
        if let Some((name, tokens)) = parse_category_line(line) {
            breakdown.categories.push(ContextCategory { name, tokens });
        }
    }
    if !saw_totals {
        return None;
    }
    breakdown.recompute_percentage();
    Some(breakdown)
}
