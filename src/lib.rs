//! Entwine – an in-memory query and evaluation engine for
//! entity–attribute–value energy system models.
//!
//! Entwine holds a schema of object classes, n-ary relationship classes and
//! parameters; indexes the loaded entities and the parameter values attached
//! to them; and answers three classes of queries:
//! * enumerate the objects of a class, optionally filtered by parameter
//!   values;
//! * enumerate the relationships of a class, filtered per dimension and
//!   projected onto the unfiltered dimensions with deduplication;
//! * evaluate a parameter at an entity, producing a scalar, an array, a
//!   time pattern, a (possibly repeating) time series, or a recursive map.
//!
//! Core constructs are shared through `Arc` and guarded by `Mutex`, with
//! per-dimension roaring-bitmap row maps and memoized filter results doing
//! the heavy lifting of relationship queries.
//!
//! ## Modules
//! * [`construct`] – Objects, classes, relationships, parameters and the
//!   row-map/memo indexes behind class queries.
//! * [`datatype`] – The [`datatype::ParameterValue`] union, the ingestion
//!   boundary ([`datatype::DbValue`], [`datatype::parameter_value`]) and
//!   deep value merging.
//! * [`evaluate`] – The evaluation contract: time-series and pattern
//!   lookups, NaN-skipping aggregation, map descent, freshness timeouts.
//! * [`timeline`] – Rollable [`timeline::TimeSlice`]s with observers,
//!   calendar period collections and duration arithmetic.
//! * [`call`] – Deferred expression trees realized over parameter values.
//! * [`environment`] – The active-environment slot and per-environment
//!   registry of named classes and parameters.
//! * [`error`] – The crate-wide error enum and `Result` alias.
//!
//! ## Quick Start
//! ```
//! use entwine::construct::{ObjectArg, ObjectClass, RelationshipClass, SelectOptions, Selection};
//!
//! let node = ObjectClass::new("node");
//! let (dublin, _) = node.create_object("Dublin");
//! let commodity = ObjectClass::new("commodity");
//! let (wind, _) = commodity.create_object("wind");
//! let flow = RelationshipClass::new(
//!     "node__commodity",
//!     vec!["node".to_string(), "commodity".to_string()],
//! )
//! .unwrap();
//! flow.add_relationship(vec![dublin.clone(), wind.clone()]).unwrap();
//! let picked = flow
//!     .select(&[("node", ObjectArg::from(&dublin))], &SelectOptions::default())
//!     .unwrap();
//! assert_eq!(picked, Selection::Objects(vec![wind]));
//! ```
//!
//! ## Concurrency
//! The engine is single-threaded cooperative: queries and mutators are
//! synchronous, caches drop wholesale on structural mutation, and observer
//! callbacks run inline during [`timeline::TimeSlice::roll`]. Mutations must
//! be serialised by the caller; the engine takes no long-lived locks.
//!
//! ## License
//! Dual licensed under Apache-2.0 and MIT.

pub mod call;
pub mod construct;
pub mod datatype;
pub mod environment;
pub mod error;
pub mod evaluate;
pub mod timeline;
