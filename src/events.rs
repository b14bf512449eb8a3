use crate::cycle::{CollectReason, CollectionKind};
use crate::stats::CycleStats;
use crate::utils::formatted_size;

/// Structured collection notifications. The core only produces these;
/// whether anyone listens is the embedder's business.
#[derive(Clone, Copy, Debug)]
pub enum GcEvent {
    CycleStart {
        kind: CollectionKind,
        reason: CollectReason,
    },
    CycleEnd {
        kind: CollectionKind,
        stats: CycleStats,
    },
    MarkStart,
    MarkEnd {
        objects_marked: usize,
    },
    SweepStart,
    SweepEnd {
        bytes_swept: usize,
    },
    CompactStart,
    CompactEnd {
        bytes_compacted: usize,
    },
}

pub trait GcEventListener: Send + Sync {
    fn on_event(&self, event: &GcEvent);
}

/// Prints `[gc]`-prefixed lines for every event.
pub struct VerboseListener;

impl GcEventListener for VerboseListener {
    fn on_event(&self, event: &GcEvent) {
        match event {
            GcEvent::CycleStart { kind, reason } => {
                eprintln!("[gc] cycle start: {:?} ({:?})", kind, reason)
            }
            GcEvent::CycleEnd { kind, stats } => eprintln!(
                "[gc] cycle end: {:?} copied {}+{} marked {} swept {}",
                kind,
                formatted_size(stats.bytes_copied_survivor),
                formatted_size(stats.bytes_copied_tenure),
                stats.objects_marked,
                formatted_size(stats.bytes_swept),
            ),
            GcEvent::MarkStart => eprintln!("[gc] mark start"),
            GcEvent::MarkEnd { objects_marked } => {
                eprintln!("[gc] mark end: {} objects", objects_marked)
            }
            GcEvent::SweepStart => eprintln!("[gc] sweep start"),
            GcEvent::SweepEnd { bytes_swept } => {
                eprintln!("[gc] sweep end: {} free", formatted_size(*bytes_swept))
            }
            GcEvent::CompactStart => eprintln!("[gc] compact start"),
            GcEvent::CompactEnd { bytes_compacted } => eprintln!(
                "[gc] compact end: {} moved",
                formatted_size(*bytes_compacted)
            ),
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Box<dyn GcEventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { listeners: vec![] }
    }

    pub fn add_listener(&mut self, listener: Box<dyn GcEventListener>) {
        self.listeners.push(listener);
    }

    pub fn emit(&self, event: GcEvent) {
        for listener in self.listeners.iter() {
            listener.on_event(&event);
        }
    }
}
