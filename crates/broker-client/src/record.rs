//! Record types crossing the broker seam.

/// A record to append to a topic partition.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Partitioning/identity key, if any.
    pub key: Option<Vec<u8>>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Transport headers (string keys and values).
    pub headers: Vec<(String, String)>,
}

impl Record {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// A record fetched from a topic partition, with its log coordinates.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// Append timestamp in milliseconds since epoch, if the broker recorded one.
    pub timestamp: Option<i64>,
}

impl FetchedRecord {
    /// First header value with the given key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A (topic, partition) pair, used for assignments and commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}
