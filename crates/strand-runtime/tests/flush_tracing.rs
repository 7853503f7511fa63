#![forbid(unsafe_code)]

//! Span and event shape of the page pipeline.
//!
//! Verifies the canonical span names, their recorded fields, and where
//! they nest, using a capturing `tracing-subscriber` layer.
//!
//! Run:
//!   cargo test -p strand-runtime --test flush_tracing

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use serde_json::json;
use strand_harness::{MemoryStore, PathExpr, RecordingBinding, RecordingRenderer};
use strand_runtime::{Page, RuntimeConfig, Store};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;

// ============================================================================
// Capture layer
// ============================================================================

#[derive(Debug, Clone)]
struct CapturedSpan {
    name: String,
    level: tracing::Level,
    fields: HashMap<String, String>,
    parent_name: Option<String>,
}

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: tracing::Level,
    message: String,
    parent_span_name: Option<String>,
}

#[derive(Default, Clone)]
struct CaptureHandle {
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    span_index: Arc<Mutex<HashMap<u64, usize>>>,
}

impl CaptureHandle {
    fn spans(&self) -> Vec<CapturedSpan> {
        self.spans.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    fn named(&self, name: &str) -> Vec<CapturedSpan> {
        self.spans().into_iter().filter(|s| s.name == name).collect()
    }

    fn has_event(&self, level: tracing::Level, message: &str) -> bool {
        self.events()
            .iter()
            .any(|e| e.level == level && e.message.contains(message))
    }
}

struct SpanCapture(CaptureHandle);

struct FieldVisitor(Vec<(String, String)>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.push((field.name().to_string(), format!("{value:?}")));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCapture
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        attrs.record(&mut visitor);
        let parent_name = ctx
            .current_span()
            .id()
            .and_then(|pid| ctx.span(pid))
            .map(|span| span.name().to_string());

        let mut fields: HashMap<String, String> = visitor.0.into_iter().collect();
        for field in attrs.metadata().fields() {
            fields.entry(field.name().to_string()).or_default();
        }

        let mut spans = self.0.spans.lock().unwrap();
        self.0
            .span_index
            .lock()
            .unwrap()
            .insert(id.into_u64(), spans.len());
        spans.push(CapturedSpan {
            name: attrs.metadata().name().to_string(),
            level: *attrs.metadata().level(),
            fields,
            parent_name,
        });
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        values.record(&mut visitor);
        let index = self.0.span_index.lock().unwrap();
        if let Some(&idx) = index.get(&id.into_u64())
            && let Some(span) = self.0.spans.lock().unwrap().get_mut(idx)
        {
            span.fields.extend(visitor.0);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor(Vec::new());
        event.record(&mut visitor);
        let message = visitor
            .0
            .into_iter()
            .find(|(k, _)| k == "message")
            .map(|(_, v)| v)
            .unwrap_or_default();
        let parent_span_name = ctx
            .current_span()
            .id()
            .and_then(|id| ctx.span(id))
            .map(|span| span.name().to_string());
        self.0.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message,
            parent_span_name,
        });
    }
}

fn with_captured_spans(f: impl FnOnce()) -> CaptureHandle {
    let handle = CaptureHandle::default();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::TRACE)
        .with(SpanCapture(handle.clone()));
    tracing::subscriber::with_default(subscriber, f);
    handle
}

fn page(store: &Rc<MemoryStore>) -> Page {
    Page::new(store.clone(), RecordingRenderer::new(), RuntimeConfig::default()).unwrap()
}

fn bind(page: &Page, p: &str) -> Rc<RecordingBinding> {
    let binding =
        RecordingBinding::new(page.root_context(), PathExpr::new(p).unwrap()).into_rc();
    page.register(binding.clone()).unwrap();
    binding
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn flush_span_records_counts() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::new();
        let page = page(&store);
        bind(&page, "users.0.name");
        bind(&page, "users");
        let detached = bind(&page, "users.0");
        detached.detach();
        store.set("users.0.name", json!("Bob")).unwrap();
    });

    let flushes = handle.named("strand.flush");
    assert_eq!(flushes.len(), 1);
    let flush = &flushes[0];
    assert_eq!(flush.level, tracing::Level::INFO);
    assert_eq!(flush.fields["rounds"], "1");
    assert_eq!(flush.fields["bindings_flushed"], "2");
    assert_eq!(flush.fields["skipped"], "1");
    assert_eq!(flush.fields["failed"], "0");
    assert!(flush.fields.contains_key("duration_us"));
    assert!(handle.has_event(tracing::Level::DEBUG, "flush complete"));
}

#[test]
fn empty_dispatch_opens_no_flush_span() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::new();
        let _page = page(&store);
        store.set("nobody.listens", json!(1)).unwrap();
    });
    assert!(handle.named("strand.flush").is_empty());
}

#[test]
fn render_flush_nests_under_render_span() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::new();
        let page = page(&store);
        bind(&page, "$render");
        page.render("app:home").unwrap();
    });

    let renders = handle.named("strand.page.render");
    assert_eq!(renders.len(), 1);
    assert_eq!(renders[0].fields["ns"], "app:home");
    assert!(renders[0].parent_name.is_none());
    assert!(!renders[0].fields["duration_us"].is_empty());

    let flushes = handle.named("strand.flush");
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].parent_name.as_deref(), Some("strand.page.render"));
}

#[test]
fn structural_edit_opens_debug_span() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::with_document(json!({ "items": [1, 2, 3] }));
        let page = page(&store);
        let scope = page.scope();
        let items = PathExpr::new("items").unwrap();
        for i in 0..3 {
            scope
                .add_item_context(&page.root_context(), &items, i, None)
                .unwrap();
        }
        store.remove("items", 0, 1).unwrap();
    });

    let structural = handle.named("strand.event_model.structural");
    assert_eq!(structural.len(), 1);
    let span = &structural[0];
    assert_eq!(span.level, tracing::Level::DEBUG);
    assert_eq!(span.fields["op"], "remove");
    assert_eq!(span.fields["path"], "items");
    assert_eq!(span.fields["count"], "1");

    let evicted = handle
        .events()
        .into_iter()
        .find(|e| e.message.contains("evicted removed items"))
        .expect("eviction is logged");
    assert_eq!(
        evicted.parent_span_name.as_deref(),
        Some("strand.event_model.structural")
    );
}

#[test]
fn attach_and_destroy_open_info_spans() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::new();
        let page = page(&store);
        page.attach().unwrap();
        page.destroy().unwrap();
    });

    assert_eq!(handle.named("strand.page.attach").len(), 1);
    let destroys = handle.named("strand.page.destroy");
    assert_eq!(destroys.len(), 1);
    assert_eq!(destroys[0].level, tracing::Level::INFO);
    assert!(handle.has_event(tracing::Level::INFO, "page destroyed"));
}

#[test]
fn failed_update_is_logged_at_warn() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::new();
        let page = page(&store);
        let binding = bind(&page, "x");
        binding.fail_with("nope");
        store.set("x", json!(1)).unwrap();
    });

    let warning = handle
        .events()
        .into_iter()
        .find(|e| e.level == tracing::Level::WARN && e.message.contains("binding update failed"))
        .expect("failure is logged");
    assert_eq!(warning.parent_span_name.as_deref(), Some("strand.flush"));
    assert_eq!(handle.named("strand.flush")[0].fields["failed"], "1");
}

#[test]
fn unresolved_dependency_is_logged_at_warn() {
    let handle = with_captured_spans(|| {
        let store = MemoryStore::new();
        let page = page(&store);
        let binding = RecordingBinding::new(
            page.root_context(),
            PathExpr::relative("text").unwrap(),
        )
        .into_rc();
        page.register(binding).unwrap();
    });
    assert!(handle.has_event(tracing::Level::WARN, "skipping dependency"));
}
