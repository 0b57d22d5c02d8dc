use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pull {
    pub locator: String,
    pub servers: Vec<String>,
    pub mount_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trash {
    pub locator: String,
    pub block_mtime: i64,
    pub mount_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub pulls: Vec<Pull>,
    pub trashes: Vec<Trash>,
}

impl fmt::Display for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChangeSet{{Pulls:{}, Trashes:{}}}",
            self.pulls.len(),
            self.trashes.len()
        )
    }
}

#[derive(Debug, Default)]
pub struct ChangeSet {
    inner: Mutex<Changes>,
}

impl ChangeSet {
    pub fn add_pull(&self, pull: Pull) {
        self.inner.lock().pulls.push(pull);
    }

    pub fn add_trash(&self, trash: Trash) {
        self.inner.lock().trashes.push(trash);
    }

    pub fn pulls(&self) -> Vec<Pull> {
        self.inner.lock().pulls.clone()
    }

    pub fn trashes(&self) -> Vec<Trash> {
        self.inner.lock().trashes.clone()
    }

    pub fn snapshot(&self) -> Changes {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        *self.inner.lock() = Changes::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_serialise_to_node_wire_format() {
        let pull = Pull {
            locator: "acbd18db4cc2f85cedef654fccc4a4d8+3".into(),
            servers: vec!["http://keep1.zzzzz.arvadosapi.com:25107".into()],
            mount_uuid: "zzzzz-ivpuk-000000000000001".into(),
        };
        let trash = Trash {
            locator: "acbd18db4cc2f85cedef654fccc4a4d8+3".into(),
            block_mtime: 12345678,
            mount_uuid: String::new(),
        };
        assert_eq!(
            serde_json::to_value(&pull).unwrap(),
            json!({
                "locator": "acbd18db4cc2f85cedef654fccc4a4d8+3",
                "servers": ["http://keep1.zzzzz.arvadosapi.com:25107"],
                "mount_uuid": "zzzzz-ivpuk-000000000000001"
            })
        );
        assert_eq!(
            serde_json::to_value(&trash).unwrap(),
            json!({
                "locator": "acbd18db4cc2f85cedef654fccc4a4d8+3",
                "block_mtime": 12345678,
                "mount_uuid": ""
            })
        );
    }

    #[test]
    fn clear_empties_both_lists() {
        let cs = ChangeSet::default();
        cs.add_trash(Trash {
            locator: "x".into(),
            block_mtime: 1,
            mount_uuid: String::new(),
        });
        assert_eq!(cs.snapshot().to_string(), "ChangeSet{Pulls:0, Trashes:1}");
        cs.clear();
        assert_eq!(cs.snapshot(), Changes::default());
    }
}
