//! Key-space commands executed against a shard.
//!
//! Each command declares the keys it touches and the lock mode it needs
//! ([`KeyAccess`]); [`Command::execute`] acquires exactly those stripes and
//! runs the command under them.

use crate::error::{CoreError, CoreResult};
use crate::lock::{HeldStripes, LockMode, WriteGuard};
use crate::shard::shard::Shard;
use crate::shard::value::StoredValue;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Capability of a command to name its keys and lock mode.
pub trait KeyAccess {
    /// Keys the command reads or writes.
    fn keys(&self) -> Vec<&str>;

    /// Lock mode the command needs.
    fn lock_mode(&self) -> LockMode;

    /// Returns true if the command may change the key space.
    fn mutates(&self) -> bool {
        self.lock_mode() == LockMode::Write
    }
}

/// A decoded key-space command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `GET key`
    Get {
        /// Key.
        key: String,
    },
    /// `SET key value`
    Set {
        /// Key.
        key: String,
        /// Value.
        value: Bytes,
    },
    /// `MSET key value [key value ...]`
    MSet {
        /// Key/value pairs.
        pairs: Vec<(String, Bytes)>,
    },
    /// `DEL key [key ...]`
    Del {
        /// Keys.
        keys: Vec<String>,
    },
    /// `RENAME from to`
    Rename {
        /// Source key.
        from: String,
        /// Destination key.
        to: String,
    },
    /// `TYPE key`
    Type {
        /// Key.
        key: String,
    },
    /// `HSET key field value [field value ...]`
    HSet {
        /// Key.
        key: String,
        /// Field/value pairs.
        fields: Vec<(String, Bytes)>,
    },
    /// `HSETNX key field value`
    HSetNx {
        /// Key.
        key: String,
        /// Field.
        field: String,
        /// Value.
        value: Bytes,
    },
    /// `HGET key field`
    HGet {
        /// Key.
        key: String,
        /// Field.
        field: String,
    },
    /// `HKEYS key`
    HKeys {
        /// Key.
        key: String,
    },
    /// `SCAN cursor COUNT n`
    Scan {
        /// Last key of the previous page.
        cursor: Option<String>,
        /// Page size.
        count: usize,
    },
    /// `FLUSHALL`
    FlushAll,
}

/// Result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`
    Ok,
    /// Null bulk.
    Nil,
    /// Bulk string.
    Bulk(Bytes),
    /// Integer.
    Integer(i64),
    /// Simple status string.
    Status(&'static str),
    /// Array of bulk strings.
    Array(Vec<Bytes>),
    /// One scan page.
    Scan {
        /// Cursor for the next page, `None` at the end.
        next: Option<String>,
        /// Keys of this page.
        keys: Vec<String>,
    },
}

impl KeyAccess for Command {
    fn keys(&self) -> Vec<&str> {
        match self {
            Self::Get { key }
            | Self::Set { key, .. }
            | Self::Type { key }
            | Self::HSet { key, .. }
            | Self::HSetNx { key, .. }
            | Self::HGet { key, .. }
            | Self::HKeys { key } => vec![key.as_str()],
            Self::MSet { pairs } => pairs.iter().map(|(k, _)| k.as_str()).collect(),
            Self::Del { keys } => keys.iter().map(String::as_str).collect(),
            Self::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Self::Scan { .. } | Self::FlushAll => Vec::new(),
        }
    }

    fn lock_mode(&self) -> LockMode {
        match self {
            Self::Get { .. }
            | Self::Type { .. }
            | Self::HGet { .. }
            | Self::HKeys { .. }
            | Self::Scan { .. } => LockMode::Read,
            Self::Set { .. }
            | Self::MSet { .. }
            | Self::Del { .. }
            | Self::Rename { .. }
            | Self::HSet { .. }
            | Self::HSetNx { .. }
            | Self::FlushAll => LockMode::Write,
        }
    }
}

fn hash_of(value: Option<StoredValue>) -> CoreResult<BTreeMap<String, Bytes>> {
    match value {
        None => Ok(BTreeMap::new()),
        Some(StoredValue::Hash(fields)) => Ok(fields),
        Some(StoredValue::String(_)) => Err(CoreError::WrongType),
    }
}

impl Command {
    /// Runs the command under the stripe locks it declares.
    ///
    /// # Errors
    ///
    /// Returns the shard's readiness errors, `WrongType`, `NoSuchKey`, or
    /// an invalid-operation error.
    pub fn execute(&self, shard: &Shard) -> CoreResult<Reply> {
        if self.mutates() {
            shard.check_writable()?;
        } else {
            shard.check_readable()?;
        }

        match self {
            Self::Scan { cursor, count } => {
                let (keys, next) = shard.index().scan(cursor.as_deref(), *count);
                Ok(Reply::Scan { next, keys })
            }
            Self::FlushAll => {
                let guard = shard.locks().write_all();
                shard.clear(&guard)?;
                Ok(Reply::Ok)
            }
            _ if self.mutates() => {
                let guard = shard.write(&self.keys());
                self.write(shard, &guard)
            }
            _ => {
                let guard = shard.read(&self.keys());
                self.read(shard, &guard)
            }
        }
    }

    fn read(&self, shard: &Shard, guard: &impl HeldStripes) -> CoreResult<Reply> {
        match self {
            Self::Get { key } => match shard.get(guard, key)? {
                None => Ok(Reply::Nil),
                Some(StoredValue::String(value)) => Ok(Reply::Bulk(value)),
                Some(StoredValue::Hash(_)) => Err(CoreError::WrongType),
            },
            Self::Type { key } => Ok(Reply::Status(
                shard.get(guard, key)?.map_or("none", |v| v.type_name()),
            )),
            Self::HGet { key, field } => {
                let fields = hash_of(shard.get(guard, key)?)?;
                Ok(fields.get(field).cloned().map_or(Reply::Nil, Reply::Bulk))
            }
            Self::HKeys { key } => {
                let fields = hash_of(shard.get(guard, key)?)?;
                Ok(Reply::Array(
                    fields.into_keys().map(Bytes::from).collect(),
                ))
            }
            _ => Err(CoreError::invalid_operation("not a read command")),
        }
    }

    fn write(&self, shard: &Shard, guard: &WriteGuard<'_>) -> CoreResult<Reply> {
        match self {
            Self::Set { key, value } => {
                shard.put(guard, key, StoredValue::String(value.clone()))?;
                Ok(Reply::Ok)
            }
            Self::MSet { pairs } => {
                for (key, value) in pairs {
                    shard.put(guard, key, StoredValue::String(value.clone()))?;
                }
                Ok(Reply::Ok)
            }
            Self::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if shard.remove(guard, key)?.is_some() {
                        removed += 1;
                    }
                }
                Ok(Reply::Integer(removed))
            }
            Self::Rename { from, to } => {
                let value = shard.get(guard, from)?.ok_or(CoreError::NoSuchKey)?;
                if from != to {
                    shard.remove(guard, from)?;
                    shard.put(guard, to, value)?;
                }
                Ok(Reply::Ok)
            }
            Self::HSet { key, fields } => {
                let mut hash = hash_of(shard.get(guard, key)?)?;
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                shard.put(guard, key, StoredValue::Hash(hash))?;
                Ok(Reply::Integer(added))
            }
            Self::HSetNx { key, field, value } => {
                let mut hash = hash_of(shard.get(guard, key)?)?;
                if hash.contains_key(field) {
                    return Ok(Reply::Integer(0));
                }
                hash.insert(field.clone(), value.clone());
                shard.put(guard, key, StoredValue::Hash(hash))?;
                Ok(Reply::Integer(1))
            }
            _ => Err(CoreError::invalid_operation("not a write command")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{ShardId, ShardKind, ShardStatus};
    use crate::volume::{Volume, VolumeConfig};
    use std::sync::Arc;

    fn shard() -> Shard {
        let volume = Arc::new(Volume::open_with(VolumeConfig::new("redis-shard-0")).unwrap());
        let shard = Shard::new(ShardKind::Redis, ShardId(0), volume, &Config::default());
        shard.restore().unwrap();
        shard.transition(ShardStatus::ReadWrite).unwrap();
        shard
    }

    fn run(shard: &Shard, command: Command) -> CoreResult<Reply> {
        command.execute(shard)
    }

    fn set(key: &str, value: &'static str) -> Command {
        Command::Set {
            key: key.into(),
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    #[test]
    fn key_access_declarations() {
        let rename = Command::Rename {
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(rename.keys(), vec!["a", "b"]);
        assert!(rename.mutates());
        assert_eq!(Command::HKeys { key: "h".into() }.lock_mode(), LockMode::Read);
        assert!(Command::FlushAll.keys().is_empty());
    }

    #[test]
    fn set_get_type() {
        let shard = shard();
        assert_eq!(run(&shard, set("k", "v")).unwrap(), Reply::Ok);
        assert_eq!(
            run(&shard, Command::Get { key: "k".into() }).unwrap(),
            Reply::Bulk(Bytes::from_static(b"v"))
        );
        assert_eq!(
            run(&shard, Command::Type { key: "k".into() }).unwrap(),
            Reply::Status("string")
        );
        assert_eq!(
            run(&shard, Command::Type { key: "nope".into() }).unwrap(),
            Reply::Status("none")
        );
    }

    #[test]
    fn rename_moves_value_and_queues_each_key_once() {
        let shard = shard();
        run(&shard, set("a", "v")).unwrap();
        shard.drain().unwrap();

        let reply = run(
            &shard,
            Command::Rename {
                from: "a".into(),
                to: "b".into(),
            },
        )
        .unwrap();
        assert_eq!(reply, Reply::Ok);
        assert_eq!(run(&shard, Command::Get { key: "a".into() }).unwrap(), Reply::Nil);
        assert_eq!(
            run(&shard, Command::Get { key: "b".into() }).unwrap(),
            Reply::Bulk(Bytes::from_static(b"v"))
        );
        assert_eq!(shard.queue().pending_keys(), vec!["a", "b"]);
    }

    #[test]
    fn rename_missing_key_fails_without_change() {
        let shard = shard();
        let err = run(
            &shard,
            Command::Rename {
                from: "a".into(),
                to: "b".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NoSuchKey));
        assert!(shard.queue().is_empty());
    }

    #[test]
    fn hash_commands() {
        let shard = shard();
        let hset = Command::HSet {
            key: "h".into(),
            fields: vec![
                ("f1".into(), Bytes::from_static(b"1")),
                ("f2".into(), Bytes::from_static(b"2")),
            ],
        };
        assert_eq!(run(&shard, hset).unwrap(), Reply::Integer(2));

        let nx = |value: &'static [u8]| Command::HSetNx {
            key: "h".into(),
            field: "f1".into(),
            value: Bytes::from_static(value),
        };
        assert_eq!(run(&shard, nx(b"x")).unwrap(), Reply::Integer(0));
        assert_eq!(
            run(
                &shard,
                Command::HGet {
                    key: "h".into(),
                    field: "f1".into()
                }
            )
            .unwrap(),
            Reply::Bulk(Bytes::from_static(b"1"))
        );
        assert_eq!(
            run(&shard, Command::HKeys { key: "h".into() }).unwrap(),
            Reply::Array(vec![Bytes::from("f1"), Bytes::from("f2")])
        );
    }

    #[test]
    fn wrong_type_is_rejected() {
        let shard = shard();
        run(&shard, set("s", "v")).unwrap();
        assert!(matches!(
            run(&shard, Command::HKeys { key: "s".into() }),
            Err(CoreError::WrongType)
        ));
        assert!(matches!(
            run(
                &shard,
                Command::HSetNx {
                    key: "s".into(),
                    field: "f".into(),
                    value: Bytes::new()
                }
            ),
            Err(CoreError::WrongType)
        ));
    }

    #[test]
    fn mset_del_scan_flushall() {
        let shard = shard();
        let mset = Command::MSet {
            pairs: ["a", "b", "c"]
                .iter()
                .map(|k| (k.to_string(), Bytes::from_static(b"x")))
                .collect(),
        };
        run(&shard, mset).unwrap();
        assert_eq!(
            run(
                &shard,
                Command::Del {
                    keys: vec!["a".into(), "zz".into()]
                }
            )
            .unwrap(),
            Reply::Integer(1)
        );
        assert_eq!(
            run(
                &shard,
                Command::Scan {
                    cursor: None,
                    count: 10
                }
            )
            .unwrap(),
            Reply::Scan {
                next: None,
                keys: vec!["b".into(), "c".into()]
            }
        );

        assert_eq!(run(&shard, Command::FlushAll).unwrap(), Reply::Ok);
        assert!(shard.is_empty());
        assert!(shard.index().is_empty());
    }

    #[test]
    fn read_only_shard_still_serves_reads() {
        let shard = shard();
        run(&shard, set("k", "v")).unwrap();
        shard.transition(ShardStatus::ReadOnly).unwrap();

        assert!(matches!(
            run(&shard, set("k", "w")),
            Err(CoreError::ShardReadOnly { .. })
        ));
        assert_eq!(
            run(&shard, Command::Get { key: "k".into() }).unwrap(),
            Reply::Bulk(Bytes::from_static(b"v"))
        );
    }
}
