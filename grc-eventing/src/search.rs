//! 事件检索（search）
//!
//! 对已取出的事件集合做纯内存的过滤、排序与分页，无副作用，可并发重复调用。
//! 流程：过滤 → 稳定排序（`created_at` 或优先级，升/降序）→ `offset`/`limit` 分页。
//! 优先级按 critical > high > medium > low 排序。
//!
use crate::envelope::{EventEnvelope, EventPriority, EventStatus};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 检索条件，未设置或空集合表示不过滤
#[derive(Debug, Clone, Default, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// 在事件类型与序列化后的 payload 中做不区分大小写的子串匹配
    #[builder(into)]
    pub text: Option<String>,
    #[builder(default)]
    pub categories: Vec<String>,
    #[builder(default)]
    pub priorities: Vec<EventPriority>,
    #[builder(default)]
    pub event_types: Vec<String>,
    #[builder(into)]
    pub source_module: Option<String>,
    #[builder(into)]
    pub entity_type: Option<String>,
    #[builder(into)]
    pub entity_id: Option<String>,
    /// 闭区间
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// 先取 `metadata.user_id`，没有再取 `payload.user_id`
    #[builder(into)]
    pub user_id: Option<String>,
    #[builder(default)]
    pub statuses: Vec<EventStatus>,
    /// payload 中必须全部存在的顶层键
    #[builder(default)]
    pub payload_keys: Vec<String>,
}

impl SearchFilters {
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        if let Some(text) = &self.text {
            if !matches_text(event, text) {
                return false;
            }
        }
        if !self.categories.is_empty()
            && !self.categories.iter().any(|c| c == event.event_category())
        {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&event.priority()) {
            return false;
        }
        if !self.event_types.is_empty()
            && !self.event_types.iter().any(|t| t == event.event_type())
        {
            return false;
        }
        if !eq_opt(&self.source_module, Some(event.source_module()))
            || !eq_opt(&self.entity_type, event.entity_type())
            || !eq_opt(&self.entity_id, event.entity_id())
        {
            return false;
        }
        if self.from.is_some_and(|from| event.created_at() < from)
            || self.to.is_some_and(|to| event.created_at() > to)
        {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if user_of(event) != Some(user_id.as_str()) {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&event.status()) {
            return false;
        }
        self.payload_keys
            .iter()
            .all(|key| event.payload().contains_key(key))
    }
}

fn eq_opt(expected: &Option<String>, actual: Option<&str>) -> bool {
    match expected {
        Some(expected) => actual == Some(expected.as_str()),
        None => true,
    }
}

fn matches_text(event: &EventEnvelope, text: &str) -> bool {
    let needle = text.to_lowercase();
    if event.event_type().to_lowercase().contains(&needle) {
        return true;
    }
    serde_json::to_string(event.payload())
        .map(|payload| payload.to_lowercase().contains(&needle))
        .unwrap_or(false)
}

fn user_of(event: &EventEnvelope) -> Option<&str> {
    event
        .metadata()
        .get("user_id")
        .or_else(|| event.payload().get("user_id"))
        .and_then(Value::as_str)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Priority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    #[builder(default)]
    pub sort_by: SortKey,
    #[builder(default)]
    pub order: SortOrder,
    #[builder(default = 20)]
    pub limit: usize,
    #[builder(default)]
    pub offset: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub events: Vec<EventEnvelope>,
    /// 过滤后的总数
    pub total: usize,
    /// 从 1 开始
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

/// 按指定键稳定排序
pub fn sort_events(events: &mut [EventEnvelope], sort_by: SortKey, order: SortOrder) {
    events.sort_by(|a, b| {
        let ordering = match sort_by {
            SortKey::CreatedAt => a.created_at().cmp(&b.created_at()),
            SortKey::Priority => a.priority().cmp(&b.priority()),
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

pub fn search(events: &[EventEnvelope], filters: &SearchFilters, options: &SearchOptions) -> SearchPage {
    let mut matched: Vec<EventEnvelope> = events
        .iter()
        .filter(|e| filters.matches(e))
        .cloned()
        .collect();
    sort_events(&mut matched, options.sort_by, options.order);

    let total = matched.len();
    let page_events: Vec<EventEnvelope> = matched
        .into_iter()
        .skip(options.offset)
        .take(options.limit)
        .collect();
    let page = match options.limit {
        0 => 1,
        limit => options.offset / limit + 1,
    };
    let has_more = options.offset.saturating_add(page_events.len()) < total;

    SearchPage {
        events: page_events,
        total,
        page,
        page_size: options.limit,
        has_more,
    }
}

/// 统计概览（按分类/优先级/状态计数）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<EventPriority, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub latest: Option<DateTime<Utc>>,
}

pub fn summarize(events: &[EventEnvelope]) -> EventSummary {
    let mut summary = EventSummary {
        total: events.len(),
        ..Default::default()
    };
    for event in events {
        *summary
            .by_category
            .entry(event.event_category().to_string())
            .or_default() += 1;
        *summary.by_priority.entry(event.priority()).or_default() += 1;
        *summary
            .by_status
            .entry(event.status().as_str().to_string())
            .or_default() += 1;
        summary.latest = summary.latest.max(Some(event.created_at()));
    }
    summary
}
