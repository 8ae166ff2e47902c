//! Typed events published after each committing step.
//!
//! Subscribers are called synchronously, in registration order, only once the
//! change they describe is durable.

use crate::models::{
    attachment::{Attachment, OwnerRef},
    upload::Upload,
};
use chrono::{DateTime, Utc};
use std::{path::PathBuf, sync::Arc};

#[derive(Debug, Clone)]
pub enum AttachmentEvent {
    /// An upload was validated, staged and recorded.
    UploadAccepted {
        session_id: String,
        upload: Upload,
        /// Filename as submitted by the client, before sanitizing.
        submitted_filename: String,
    },
    /// A session was committed to an owner.
    Attached {
        owner: OwnerRef,
        attachments: Vec<Attachment>,
    },
    /// A staged file was rejected by the virus scanner.
    VirusDetected {
        /// Acting user, or `unknown`.
        user: String,
        filename: String,
        threat: String,
        time_of_upload: DateTime<Utc>,
        /// `None` when the file was deleted instead of quarantined.
        quarantine_path: Option<PathBuf>,
    },
    /// An attachment's bytes are about to be streamed to a caller.
    Downloaded {
        attachment_id: i64,
        actor: Option<String>,
    },
}

impl AttachmentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AttachmentEvent::UploadAccepted { .. } => "upload_accepted",
            AttachmentEvent::Attached { .. } => "attached",
            AttachmentEvent::VirusDetected { .. } => "virus_detected",
            AttachmentEvent::Downloaded { .. } => "downloaded",
        }
    }
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &AttachmentEvent);
}

/// Observer list shared by every engine clone.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn publish(&self, event: AttachmentEvent) {
        tracing::trace!(event = event.name(), subscribers = self.subscribers.len(), "publishing");
        for subscriber in &self.subscribers {
            subscriber.on_event(&event);
        }
    }
}

/// Writes every event to the log. Virus detections go out at `warn` so they can
/// be routed to alerting.
pub struct LogSubscriber;

impl EventSubscriber for LogSubscriber {
    fn on_event(&self, event: &AttachmentEvent) {
        match event {
            AttachmentEvent::UploadAccepted {
                session_id, upload, ..
            } => tracing::info!(
                session = %session_id,
                upload_id = upload.id,
                file = %upload.original_filename,
                size_bytes = upload.size_bytes,
                "upload accepted"
            ),
            AttachmentEvent::Attached { owner, attachments } => tracing::info!(
                owner_type = %owner.owner_type,
                owner_id = %owner.owner_id,
                count = attachments.len(),
                "attachments attached"
            ),
            AttachmentEvent::VirusDetected {
                user,
                filename,
                threat,
                time_of_upload,
                quarantine_path,
            } => tracing::warn!(
                user = %user,
                file = %filename,
                threat = %threat,
                uploaded_at = %time_of_upload,
                quarantine = ?quarantine_path,
                "virus detected in upload"
            ),
            AttachmentEvent::Downloaded {
                attachment_id,
                actor,
            } => tracing::info!(attachment_id, actor = ?actor, "attachment downloaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl EventSubscriber for Recorder {
        fn on_event(&self, event: &AttachmentEvent) {
            self.0.lock().unwrap().push(event.name());
        }
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let mut bus = EventBus::new();
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());
        bus.subscribe(Arc::new(LogSubscriber));

        bus.publish(AttachmentEvent::Downloaded {
            attachment_id: 1,
            actor: None,
        });
        bus.publish(AttachmentEvent::Attached {
            owner: OwnerRef::new("crm.contact", "1"),
            attachments: vec![],
        });

        assert_eq!(*first.0.lock().unwrap(), vec!["downloaded", "attached"]);
        assert_eq!(*second.0.lock().unwrap(), vec!["downloaded", "attached"]);
    }
}
