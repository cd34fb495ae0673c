//! Postfix log ingestion pipeline.
//!
//! Lines flow from a source through a transformer into records, which a
//! publisher fans out to the delivery tracker, the raw log store and the
//! version detector. Each store owns a single SQLite writer fed through an
//! action queue.

pub mod announcer;
pub mod clock;
pub mod db;
pub mod dbrunner;
pub mod delivery;
pub mod deliverydb;
pub mod interval;
pub mod metadata;
pub mod postfixversion;
pub mod publisher;
pub mod rawlogs;
pub mod reader;
pub mod runner;
pub mod sources;
pub mod tracker;
pub mod transform;

pub use announcer::{ImportAnnouncer, Progress};
pub use clock::{Clock, RealClock};
pub use db::Database;
pub use publisher::{MultiPublisher, Publisher};
pub use reader::{LineSource, ReadContext, SourceLine, read_lines};
pub use runner::Running;
