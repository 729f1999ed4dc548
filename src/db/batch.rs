//! Buffered multi-operation writes.
//!
//! A `WriteBatch` queues mutations across categories and commits them
//! through the normal write paths. Entries of different categories land
//! in their own log families in arbitrary inter-category order; there is
//! no rollback — an error aborts the remainder of the batch with every
//! already-applied operation kept.

use crate::error::Result;

#[derive(Debug)]
enum BatchOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    HSet { key: Vec<u8>, field: Vec<u8>, value: Vec<u8> },
    HDel { key: Vec<u8>, field: Vec<u8> },
    SAdd { key: Vec<u8>, member: Vec<u8> },
    SRem { key: Vec<u8>, member: Vec<u8> },
    ZAdd { key: Vec<u8>, score: f64, member: Vec<u8> },
    ZRem { key: Vec<u8>, member: Vec<u8> },
    LPush { key: Vec<u8>, value: Vec<u8> },
    RPush { key: Vec<u8>, value: Vec<u8> },
}

/// A buffer of pending mutations, applied by [`Db::write_batch`](super::Db::write_batch).
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.push(BatchOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.push(BatchOp::Delete { key: key.to_vec() })
    }

    pub fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> &mut Self {
        self.push(BatchOp::HSet {
            key: key.to_vec(),
            field: field.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn hdel(&mut self, key: &[u8], field: &[u8]) -> &mut Self {
        self.push(BatchOp::HDel {
            key: key.to_vec(),
            field: field.to_vec(),
        })
    }

    pub fn sadd(&mut self, key: &[u8], member: &[u8]) -> &mut Self {
        self.push(BatchOp::SAdd {
            key: key.to_vec(),
            member: member.to_vec(),
        })
    }

    pub fn srem(&mut self, key: &[u8], member: &[u8]) -> &mut Self {
        self.push(BatchOp::SRem {
            key: key.to_vec(),
            member: member.to_vec(),
        })
    }

    pub fn zadd(&mut self, key: &[u8], score: f64, member: &[u8]) -> &mut Self {
        self.push(BatchOp::ZAdd {
            key: key.to_vec(),
            score,
            member: member.to_vec(),
        })
    }

    pub fn zrem(&mut self, key: &[u8], member: &[u8]) -> &mut Self {
        self.push(BatchOp::ZRem {
            key: key.to_vec(),
            member: member.to_vec(),
        })
    }

    pub fn lpush(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.push(BatchOp::LPush {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn rpush(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.push(BatchOp::RPush {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }
}

impl super::Db {
    /// Applies every queued operation in insertion order.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        for op in batch.ops {
            match op {
                BatchOp::Set { key, value } => self.set(&key, &value)?,
                BatchOp::Delete { key } => self.delete(&key)?,
                BatchOp::HSet { key, field, value } => {
                    self.hset(&key, &[(field.as_slice(), value.as_slice())])?
                }
                BatchOp::HDel { key, field } => {
                    self.hdel(&key, &[field.as_slice()])?;
                }
                BatchOp::SAdd { key, member } => self.sadd(&key, &[member.as_slice()])?,
                BatchOp::SRem { key, member } => {
                    self.srem(&key, &[member.as_slice()])?;
                }
                BatchOp::ZAdd { key, score, member } => {
                    self.zadd(&key, &[(score, member.as_slice())])?
                }
                BatchOp::ZRem { key, member } => {
                    self.zrem(&key, &[member.as_slice()])?;
                }
                BatchOp::LPush { key, value } => self.lpush(&key, &[value.as_slice()])?,
                BatchOp::RPush { key, value } => self.rpush(&key, &[value.as_slice()])?,
            }
        }
        Ok(())
    }
}
