//! Classifies the sync daemon's raw disk events into
//! `LocalChangeDetected`/`RemoteChangeDetected` (each carrying
//! `{folderID, path, action, type}`), passing anything else through
//! untouched for downstream consumers to decide.

use serde_json::Value;
use triarchive_tools::sync_daemon::DiskEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Deleted,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub source: ChangeSource,
    pub folder_id: String,
    pub path: String,
    pub action: ChangeAction,
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Change(ChangeEvent),
    Other(DiskEvent),
}

/// Classifies a raw event. `LocalChangeDetected`/`RemoteChangeDetected`
/// with a recognized `action`/`type` pair become a `ChangeEvent`; anything
/// else (including a recognized kind with an unparseable payload) is
/// passed through as `Other`.
pub fn classify(event: DiskEvent) -> ListenerEvent {
    let source = match event.kind.as_str() {
        "LocalChangeDetected" => ChangeSource::Local,
        "RemoteChangeDetected" => ChangeSource::Remote,
        _ => return ListenerEvent::Other(event),
    };

    let folder_id = event.data.get("folderID").and_then(Value::as_str);
    let path = event.data.get("path").and_then(Value::as_str);
    let action = event.data.get("action").and_then(Value::as_str).and_then(parse_action);
    let kind = event.data.get("type").and_then(Value::as_str).and_then(parse_kind);

    match (folder_id, path, action, kind) {
        (Some(folder_id), Some(path), Some(action), Some(kind)) => ListenerEvent::Change(ChangeEvent {
            source,
            folder_id: folder_id.to_string(),
            path: path.to_string(),
            action,
            kind,
        }),
        _ => ListenerEvent::Other(event),
    }
}

fn parse_action(raw: &str) -> Option<ChangeAction> {
    match raw {
        "deleted" => Some(ChangeAction::Deleted),
        "modified" => Some(ChangeAction::Modified),
        _ => None,
    }
}

fn parse_kind(raw: &str) -> Option<EntryKind> {
    match raw {
        "file" => Some(EntryKind::File),
        "dir" | "directory" => Some(EntryKind::Directory),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(kind: &str, data: HashMap<String, Value>) -> DiskEvent {
        DiskEvent {
            id: 1,
            global_id: None,
            kind: kind.to_string(),
            time: None,
            data,
        }
    }

    #[test]
    fn recognizes_local_change_with_full_payload() {
        let mut data = HashMap::new();
        data.insert("folderID".into(), Value::String("f1".into()));
        data.insert("path".into(), Value::String("a/b.txt".into()));
        data.insert("action".into(), Value::String("modified".into()));
        data.insert("type".into(), Value::String("file".into()));

        match classify(event("LocalChangeDetected", data)) {
            ListenerEvent::Change(c) => {
                assert_eq!(c.source, ChangeSource::Local);
                assert_eq!(c.folder_id, "f1");
                assert_eq!(c.action, ChangeAction::Modified);
                assert_eq!(c.kind, EntryKind::File);
            }
            ListenerEvent::Other(_) => panic!("expected a classified change"),
        }
    }

    #[test]
    fn passes_through_unrecognized_event_kind() {
        let event = event("ItemStarted", HashMap::new());
        assert!(matches!(classify(event), ListenerEvent::Other(_)));
    }

    #[test]
    fn passes_through_recognized_kind_with_incomplete_payload() {
        let event = event("RemoteChangeDetected", HashMap::new());
        assert!(matches!(classify(event), ListenerEvent::Other(_)));
    }
}
