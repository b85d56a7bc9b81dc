use std::sync::{Arc, Mutex};

// keepers use HashMap/HashSet with seahash, like the rest of the engine
use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasherDefault, Hash, Hasher};

use seahash::SeaHasher;

// row sets are roaring bitmaps; ascending iteration doubles as sorted order
use roaring::RoaringTreemap;

// used to print out readable forms of a construct
use std::fmt;

use lazy_static::lazy_static;
use tracing::{debug, info};

// our own stuff that we need
use crate::datatype::{merge_values, ParameterValue, Scalar};
use crate::error::{EntwineError, Result};
use crate::evaluate::{fold_maximum, CallArgs};
use crate::timeline::Observer;

// ------------- Thing -------------
pub type Thing = u64;

pub type ThingHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub const GENESIS: Thing = 0;

#[derive(Debug)]
pub struct ThingGenerator {
    lower_bound: Thing,
    retained: HashSet<Thing, ThingHasher>,
}

impl ThingGenerator {
    pub fn new() -> Self {
        Self {
            lower_bound: GENESIS,
            retained: HashSet::default(),
        }
    }
    // Things may carry externally assigned identities; retaining them keeps
    // the generator from handing the same identity out again.
    pub fn retain(&mut self, t: Thing) {
        self.retained.insert(t);
        if t > self.lower_bound {
            self.lower_bound = t;
        }
    }
    pub fn check(&self, t: Thing) -> Option<Thing> {
        self.retained.get(&t).cloned()
    }
    pub fn generate(&mut self) -> Thing {
        self.lower_bound += 1;
        self.retained.insert(self.lower_bound);
        self.lower_bound
    }
}

impl Default for ThingGenerator {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref THING_GENERATOR: Mutex<ThingGenerator> = Mutex::new(ThingGenerator::new());
}

pub fn next_thing() -> Thing {
    THING_GENERATOR.lock().unwrap().generate()
}

pub fn retain_thing(t: Thing) {
    THING_GENERATOR.lock().unwrap().retain(t);
}

// ------------- Object -------------
/// A named entity with a stable identity. Group membership is a plain
/// directed relation; no cycle check is performed on insert.
pub struct Object {
    object: Thing,
    name: String,
    members: Mutex<Vec<Arc<Object>>>,
    groups: Mutex<Vec<Arc<Object>>>,
}

impl Object {
    pub fn new(name: &str) -> Arc<Object> {
        Arc::new(Object {
            object: next_thing(),
            name: name.to_string(),
            members: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
        })
    }
    /// An object with an identity assigned by the ingestion boundary.
    pub fn with_id(name: &str, id: Thing) -> Arc<Object> {
        retain_thing(id);
        Arc::new(Object {
            object: id,
            name: name.to_string(),
            members: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
        })
    }
    pub fn object(&self) -> Thing {
        self.object
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn members(&self) -> Vec<Arc<Object>> {
        self.members.lock().unwrap().clone()
    }
    pub fn groups(&self) -> Vec<Arc<Object>> {
        self.groups.lock().unwrap().clone()
    }
    pub fn add_member(group: &Arc<Object>, member: &Arc<Object>) {
        group.members.lock().unwrap().push(Arc::clone(member));
        member.groups.lock().unwrap().push(Arc::clone(group));
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}
impl Eq for Object {}
impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object.hash(state);
    }
}
impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Object({}, {})", self.object, self.name)
    }
}
impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ------------- Filter operands -------------
/// A per-dimension constraint: a single object, several, or the `anything`
/// wildcard that satisfies every membership predicate.
#[derive(Debug, Clone)]
pub enum ObjectArg {
    Anything,
    One(Arc<Object>),
    Many(Vec<Arc<Object>>),
}

impl ObjectArg {
    pub fn admits(&self, object: &Arc<Object>) -> bool {
        self.admits_id(object.object())
    }
    pub fn admits_id(&self, id: Thing) -> bool {
        match self {
            ObjectArg::Anything => true,
            ObjectArg::One(o) => o.object() == id,
            ObjectArg::Many(objects) => objects.iter().any(|o| o.object() == id),
        }
    }
    fn entry(&self) -> FilterEntry {
        match self {
            ObjectArg::Anything => FilterEntry::Anything,
            ObjectArg::One(o) => FilterEntry::Objects(vec![o.object()]),
            ObjectArg::Many(objects) => {
                let mut ids: Vec<Thing> = objects.iter().map(|o| o.object()).collect();
                ids.sort_unstable();
                ids.dedup();
                FilterEntry::Objects(ids)
            }
        }
    }
}

impl From<Arc<Object>> for ObjectArg {
    fn from(object: Arc<Object>) -> Self {
        ObjectArg::One(object)
    }
}
impl From<&Arc<Object>> for ObjectArg {
    fn from(object: &Arc<Object>) -> Self {
        ObjectArg::One(Arc::clone(object))
    }
}
impl From<Vec<Arc<Object>>> for ObjectArg {
    fn from(objects: Vec<Arc<Object>>) -> Self {
        ObjectArg::Many(objects)
    }
}

impl fmt::Display for ObjectArg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectArg::Anything => write!(f, "anything"),
            ObjectArg::One(o) => write!(f, "{o}"),
            ObjectArg::Many(objects) => {
                let names: Vec<&str> = objects.iter().map(|o| o.name()).collect();
                write!(f, "({})", names.join(", "))
            }
        }
    }
}

/// Canonical form of one filter operand inside a memo key: `anything` is
/// encoded distinctly, object sets as sorted deduplicated identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterEntry {
    Anything,
    Objects(Vec<Thing>),
}

pub type FilterKey = Vec<(String, FilterEntry)>;

pub(crate) fn canonical_key(filters: &[(&str, ObjectArg)]) -> FilterKey {
    let mut key: FilterKey = filters
        .iter()
        .map(|(label, arg)| (label.to_string(), arg.entry()))
        .collect();
    key.sort_by(|a, b| a.0.cmp(&b.0));
    key
}

/// The operand of an object-class parameter filter: either a plain value or
/// an object, which matches a stored symbol of the same name.
#[derive(Debug, Clone)]
pub enum FilterOperand {
    Value(ParameterValue),
    Object(Arc<Object>),
}

impl FilterOperand {
    fn matches(&self, evaluated: &ParameterValue) -> bool {
        match self {
            FilterOperand::Value(v) => evaluated == v,
            FilterOperand::Object(o) => {
                matches!(evaluated, ParameterValue::Scalar(Scalar::Symbol(name)) if name == o.name())
            }
        }
    }
}

impl From<ParameterValue> for FilterOperand {
    fn from(value: ParameterValue) -> Self {
        FilterOperand::Value(value)
    }
}
impl From<Arc<Object>> for FilterOperand {
    fn from(object: Arc<Object>) -> Self {
        FilterOperand::Object(object)
    }
}

// ------------- Relationship -------------
/// One n-ary row: dimension labels and the objects bound to them.
#[derive(Debug, Clone)]
pub struct Relationship {
    labels: Vec<String>,
    objects: Vec<Arc<Object>>,
}

impl Relationship {
    pub fn new(labels: Vec<String>, objects: Vec<Arc<Object>>) -> Relationship {
        Relationship { labels, objects }
    }
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
    pub fn objects(&self) -> &[Arc<Object>] {
        &self.objects
    }
    pub fn get(&self, label: &str) -> Option<&Arc<Object>> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| &self.objects[i])
    }
    pub(crate) fn key(&self) -> Vec<Thing> {
        self.objects.iter().map(|o| o.object()).collect()
    }
}

impl PartialEq for Relationship {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels && self.key() == other.key()
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .labels
            .iter()
            .zip(self.objects.iter())
            .map(|(label, object)| format!("{label}={object}"))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

// ------------- Selection -------------
/// The outcome of a relationship query after projection. An empty compact
/// result is `Default`, which the caller replaces with whatever fallback
/// it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Rows(Vec<Relationship>),
    Objects(Vec<Arc<Object>>),
    Tuples(Vec<Relationship>),
    Default,
}

impl Selection {
    pub fn is_default(&self) -> bool {
        matches!(self, Selection::Default)
    }
    pub fn or(self, fallback: Selection) -> Selection {
        if self.is_default() {
            fallback
        } else {
            self
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectOptions {
    pub compact: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        SelectOptions { compact: true }
    }
}

// ------------- ObjectClass -------------
type ParameterEntry = HashMap<String, ParameterValue, OtherHasher>;

#[derive(Debug)]
pub struct ObjectClass {
    name: String,
    objects: Mutex<Vec<Arc<Object>>>,
    kept: Mutex<HashMap<String, Arc<Object>, OtherHasher>>,
    lookup: Mutex<HashMap<Thing, Arc<Object>, ThingHasher>>, // double indexing, but lookups by identity must not scan
    parameter_values: Mutex<HashMap<Thing, ParameterEntry, ThingHasher>>,
    parameter_defaults: Mutex<ParameterEntry>,
    env: Mutex<HashSet<String, OtherHasher>>,
}

impl ObjectClass {
    pub fn new(name: &str) -> Arc<ObjectClass> {
        Arc::new(ObjectClass {
            name: name.to_string(),
            objects: Mutex::new(Vec::new()),
            kept: Mutex::new(HashMap::default()),
            lookup: Mutex::new(HashMap::default()),
            parameter_values: Mutex::new(HashMap::default()),
            parameter_defaults: Mutex::new(HashMap::default()),
            env: Mutex::new(HashSet::default()),
        })
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn environments(&self) -> Vec<String> {
        self.env.lock().unwrap().iter().cloned().collect()
    }
    pub(crate) fn add_env(&self, env: &str) {
        self.env.lock().unwrap().insert(env.to_string());
    }

    /// Keeps an object, deduplicating by name. Returns the kept object and
    /// whether it was previously kept.
    pub fn add_object(&self, object: Arc<Object>) -> (Arc<Object>, bool) {
        let mut kept = self.kept.lock().unwrap();
        if let Some(existing) = kept.get(object.name()) {
            return (Arc::clone(existing), true);
        }
        kept.insert(object.name().to_string(), Arc::clone(&object));
        self.lookup
            .lock()
            .unwrap()
            .insert(object.object(), Arc::clone(&object));
        self.objects.lock().unwrap().push(Arc::clone(&object));
        (object, false)
    }
    pub fn add_objects(&self, objects: Vec<Arc<Object>>) -> Vec<Arc<Object>> {
        objects
            .into_iter()
            .map(|o| self.add_object(o).0)
            .collect()
    }
    pub fn create_object(&self, name: &str) -> (Arc<Object>, bool) {
        if let Some(existing) = self.get(name) {
            return (existing, true);
        }
        self.add_object(Object::new(name))
    }

    pub fn objects(&self) -> Vec<Arc<Object>> {
        self.objects.lock().unwrap().clone()
    }
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Lookup by name; the unique object with that name, or nothing.
    pub fn get(&self, name: &str) -> Option<Arc<Object>> {
        self.kept.lock().unwrap().get(name).cloned()
    }
    pub fn lookup(&self, thing: Thing) -> Option<Arc<Object>> {
        self.lookup.lock().unwrap().get(&thing).cloned()
    }

    /// The objects whose effective parameter values match every filter.
    pub fn filter(&self, filters: &[(&str, FilterOperand)]) -> Vec<Arc<Object>> {
        let no_args = CallArgs::default();
        self.objects()
            .into_iter()
            .filter(|object| {
                filters.iter().all(|(parameter, operand)| {
                    let evaluated = self
                        .effective_value(object.object(), parameter)
                        .call(&no_args, None);
                    operand.matches(&evaluated)
                })
            })
            .collect()
    }

    pub fn add_parameter_values(
        &self,
        object: &Arc<Object>,
        entries: Vec<(String, ParameterValue)>,
        merge: bool,
    ) -> Result<()> {
        if self.lookup(object.object()).is_none() {
            return Err(EntwineError::Invariant(format!(
                "object {} is not a member of class {}",
                object.name(),
                self.name
            )));
        }
        let mut values = self.parameter_values.lock().unwrap();
        let slot = values.entry(object.object()).or_default();
        for (parameter, value) in entries {
            let stored = if merge {
                match slot.get(&parameter) {
                    Some(old) => merge_values(old, value)?,
                    None => value,
                }
            } else {
                value
            };
            slot.insert(parameter, stored);
        }
        Ok(())
    }

    pub fn add_parameter_defaults(
        &self,
        entries: Vec<(String, ParameterValue)>,
        merge: bool,
    ) -> Result<()> {
        let mut defaults = self.parameter_defaults.lock().unwrap();
        for (parameter, value) in entries {
            let stored = if merge {
                match defaults.get(&parameter) {
                    Some(old) => merge_values(old, value)?,
                    None => value,
                }
            } else {
                value
            };
            defaults.insert(parameter, stored);
        }
        Ok(())
    }

    /// Stored value, else the class default, else nothing.
    pub fn effective_value(&self, object: Thing, parameter: &str) -> ParameterValue {
        if let Some(entry) = self.parameter_values.lock().unwrap().get(&object) {
            if let Some(value) = entry.get(parameter) {
                return value.clone();
            }
        }
        self.default_value(parameter)
    }
    pub(crate) fn default_value(&self, parameter: &str) -> ParameterValue {
        self.parameter_defaults
            .lock()
            .unwrap()
            .get(parameter)
            .cloned()
            .unwrap_or(ParameterValue::Nothing)
    }
    pub(crate) fn stored_entities(&self, parameter: &str) -> Vec<Thing> {
        self.parameter_values
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.contains_key(parameter))
            .map(|(id, _)| *id)
            .collect()
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ------------- RelationshipClass -------------
#[derive(Debug)]
pub struct RelationshipClass {
    name: String,
    object_class_names: Mutex<Vec<String>>,
    intact_object_class_names: Mutex<Vec<String>>, // undisambiguated labels
    relationships: Mutex<Vec<Vec<Arc<Object>>>>,
    parameter_values: Mutex<HashMap<Vec<Thing>, ParameterEntry, OtherHasher>>,
    parameter_defaults: Mutex<ParameterEntry>,
    row_map: Mutex<HashMap<String, HashMap<Thing, RoaringTreemap, ThingHasher>, OtherHasher>>,
    memo: Mutex<HashMap<FilterKey, Arc<RoaringTreemap>, OtherHasher>>,
    lookup_cache: Mutex<HashMap<(bool, FilterKey), Selection, OtherHasher>>,
    env: Mutex<HashSet<String, OtherHasher>>,
}

impl RelationshipClass {
    pub fn new(name: &str, labels: Vec<String>) -> Result<Arc<RelationshipClass>> {
        let intact = labels.clone();
        Self::with_intact(name, labels, intact)
    }
    /// Duplicate dimensions must arrive suffixed; `intact` carries the
    /// undisambiguated labels.
    pub fn with_intact(
        name: &str,
        labels: Vec<String>,
        intact: Vec<String>,
    ) -> Result<Arc<RelationshipClass>> {
        if labels.len() != intact.len() {
            return Err(EntwineError::Invariant(format!(
                "class {name} has {} labels but {} intact labels",
                labels.len(),
                intact.len()
            )));
        }
        let mut seen: HashSet<&str, OtherHasher> = HashSet::default();
        for label in &labels {
            if !seen.insert(label.as_str()) {
                return Err(EntwineError::Invariant(format!(
                    "duplicate dimension {label} on class {name}; suffix duplicates to disambiguate"
                )));
            }
        }
        let mut row_map: HashMap<String, HashMap<Thing, RoaringTreemap, ThingHasher>, OtherHasher> =
            HashMap::default();
        for label in &labels {
            row_map.insert(label.clone(), HashMap::default());
        }
        Ok(Arc::new(RelationshipClass {
            name: name.to_string(),
            object_class_names: Mutex::new(labels),
            intact_object_class_names: Mutex::new(intact),
            relationships: Mutex::new(Vec::new()),
            parameter_values: Mutex::new(HashMap::default()),
            parameter_defaults: Mutex::new(HashMap::default()),
            row_map: Mutex::new(row_map),
            memo: Mutex::new(HashMap::default()),
            lookup_cache: Mutex::new(HashMap::default()),
            env: Mutex::new(HashSet::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn object_class_names(&self) -> Vec<String> {
        self.object_class_names.lock().unwrap().clone()
    }
    pub fn intact_object_class_names(&self) -> Vec<String> {
        self.intact_object_class_names.lock().unwrap().clone()
    }
    pub fn dimensionality(&self) -> usize {
        self.object_class_names.lock().unwrap().len()
    }
    pub fn environments(&self) -> Vec<String> {
        self.env.lock().unwrap().iter().cloned().collect()
    }
    pub(crate) fn add_env(&self, env: &str) {
        self.env.lock().unwrap().insert(env.to_string());
    }
    pub fn len(&self) -> usize {
        self.relationships.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends rows, deduplicating against the existing ones, and keeps the
    /// per-dimension row map in step. Every row must bind each dimension.
    pub fn add_relationships(&self, rows: Vec<Vec<Arc<Object>>>) -> Result<()> {
        let labels = self.object_class_names();
        for row in &rows {
            if row.len() != labels.len() {
                return Err(EntwineError::Invariant(format!(
                    "relationship arity {} does not match dimensions {} of class {}",
                    row.len(),
                    labels.len(),
                    self.name
                )));
            }
        }
        let added = {
            let mut relationships = self.relationships.lock().unwrap();
            let mut row_map = self.row_map.lock().unwrap();
            let mut seen: HashSet<Vec<Thing>, OtherHasher> = relationships
                .iter()
                .map(|row| row.iter().map(|o| o.object()).collect())
                .collect();
            let mut added = 0usize;
            for row in rows {
                let key: Vec<Thing> = row.iter().map(|o| o.object()).collect();
                if !seen.insert(key) {
                    continue;
                }
                let index = relationships.len() as u64;
                for (label, object) in labels.iter().zip(row.iter()) {
                    row_map
                        .entry(label.clone())
                        .or_default()
                        .entry(object.object())
                        .or_insert_with(RoaringTreemap::new)
                        .insert(index);
                }
                relationships.push(row);
                added += 1;
            }
            added
        };
        if added > 0 {
            self.invalidate();
            info!(class = %self.name, added, "relationships added");
        }
        Ok(())
    }
    pub fn add_relationship(&self, row: Vec<Arc<Object>>) -> Result<()> {
        self.add_relationships(vec![row])
    }

    /// The raw row vector, in insertion order.
    pub fn relationships(&self) -> Vec<Relationship> {
        let labels = self.object_class_names();
        self.relationships
            .lock()
            .unwrap()
            .iter()
            .map(|row| Relationship::new(labels.clone(), row.clone()))
            .collect()
    }

    // Memoized resolution of a canonical filter key to a row set. A filter
    // on `anything` is skipped; otherwise the union over the filter's
    // objects is intersected into the running set.
    fn find_rows(&self, key: &FilterKey) -> Arc<RoaringTreemap> {
        {
            let memo = self.memo.lock().unwrap();
            if let Some(hit) = memo.get(key) {
                debug!(class = %self.name, "row memo hit");
                return Arc::clone(hit);
            }
        }
        let total = self.relationships.lock().unwrap().len() as u64;
        let rows = {
            let row_map = self.row_map.lock().unwrap();
            let mut running: Option<RoaringTreemap> = None;
            for (label, entry) in key {
                let ids = match entry {
                    FilterEntry::Anything => continue,
                    FilterEntry::Objects(ids) => ids,
                };
                let mut union = RoaringTreemap::new();
                if let Some(per_label) = row_map.get(label) {
                    for id in ids {
                        if let Some(bitmap) = per_label.get(id) {
                            union |= bitmap;
                        }
                    }
                }
                running = Some(match running {
                    None => union,
                    Some(mut acc) => {
                        acc &= &union;
                        acc
                    }
                });
                if running.as_ref().map_or(false, |r| r.is_empty()) {
                    break;
                }
            }
            running.unwrap_or_else(|| (0..total).collect())
        };
        let rows = Arc::new(rows);
        self.memo
            .lock()
            .unwrap()
            .insert(key.clone(), Arc::clone(&rows));
        rows
    }

    /// Filters rows per dimension and projects onto the unfiltered labels,
    /// deduplicating by first occurrence. An unknown label is an error; a
    /// known label bound to absent objects just selects nothing.
    pub fn select(&self, filters: &[(&str, ObjectArg)], options: &SelectOptions) -> Result<Selection> {
        if filters.is_empty() {
            return Ok(Selection::Rows(self.relationships()));
        }
        let labels = self.object_class_names();
        for (label, _) in filters {
            if !labels.iter().any(|l| l == label) {
                return Err(EntwineError::Filter {
                    key: label.to_string(),
                    class: self.name.clone(),
                });
            }
        }
        let key = canonical_key(filters);
        let cache_key = (options.compact, key.clone());
        if let Some(hit) = self.lookup_cache.lock().unwrap().get(&cache_key) {
            debug!(class = %self.name, "lookup cache hit");
            return Ok(hit.clone());
        }
        let row_set = self.find_rows(&key);
        let remaining: Vec<String> = labels
            .iter()
            .filter(|l| !filters.iter().any(|(f, _)| *f == l.as_str()))
            .cloned()
            .collect();
        let selection = {
            let rows = self.relationships.lock().unwrap();
            if !options.compact {
                let full: Vec<Relationship> = row_set
                    .iter()
                    .map(|i| Relationship::new(labels.clone(), rows[i as usize].clone()))
                    .collect();
                if full.is_empty() {
                    Selection::Default
                } else {
                    Selection::Rows(full)
                }
            } else if remaining.is_empty() {
                Selection::Default
            } else if remaining.len() == 1 {
                let position = labels.iter().position(|l| *l == remaining[0]).unwrap();
                let mut seen: HashSet<Thing, ThingHasher> = HashSet::default();
                let mut objects = Vec::new();
                for i in row_set.iter() {
                    let object = &rows[i as usize][position];
                    if seen.insert(object.object()) {
                        objects.push(Arc::clone(object));
                    }
                }
                if objects.is_empty() {
                    Selection::Default
                } else {
                    Selection::Objects(objects)
                }
            } else {
                let positions: Vec<usize> = remaining
                    .iter()
                    .map(|label| labels.iter().position(|l| l == label).unwrap())
                    .collect();
                let mut seen: HashSet<Vec<Thing>, OtherHasher> = HashSet::default();
                let mut tuples = Vec::new();
                for i in row_set.iter() {
                    let row = &rows[i as usize];
                    let projected: Vec<Arc<Object>> =
                        positions.iter().map(|&p| Arc::clone(&row[p])).collect();
                    let dedup_key: Vec<Thing> = projected.iter().map(|o| o.object()).collect();
                    if seen.insert(dedup_key) {
                        tuples.push(Relationship::new(remaining.clone(), projected));
                    }
                }
                if tuples.is_empty() {
                    Selection::Default
                } else {
                    Selection::Tuples(tuples)
                }
            }
        };
        self.lookup_cache
            .lock()
            .unwrap()
            .insert(cache_key, selection.clone());
        Ok(selection)
    }

    pub fn add_parameter_values(
        &self,
        objects: &[Arc<Object>],
        entries: Vec<(String, ParameterValue)>,
        merge: bool,
    ) -> Result<()> {
        let labels = self.object_class_names();
        if objects.len() != labels.len() {
            return Err(EntwineError::Invariant(format!(
                "parameter value key arity {} does not match dimensions {} of class {}",
                objects.len(),
                labels.len(),
                self.name
            )));
        }
        let key: Vec<Thing> = objects.iter().map(|o| o.object()).collect();
        let mut values = self.parameter_values.lock().unwrap();
        let slot = values.entry(key).or_default();
        for (parameter, value) in entries {
            let stored = if merge {
                match slot.get(&parameter) {
                    Some(old) => merge_values(old, value)?,
                    None => value,
                }
            } else {
                value
            };
            slot.insert(parameter, stored);
        }
        Ok(())
    }

    pub fn add_parameter_defaults(
        &self,
        entries: Vec<(String, ParameterValue)>,
        merge: bool,
    ) -> Result<()> {
        let mut defaults = self.parameter_defaults.lock().unwrap();
        for (parameter, value) in entries {
            let stored = if merge {
                match defaults.get(&parameter) {
                    Some(old) => merge_values(old, value)?,
                    None => value,
                }
            } else {
                value
            };
            defaults.insert(parameter, stored);
        }
        Ok(())
    }

    /// Appends a dimension bound to `object` on every existing row: labels
    /// grow, stored value keys are rekeyed, the new row-map column holds all
    /// rows, and the caches drop.
    pub fn add_dimension(&self, label: &str, object: Arc<Object>) -> Result<()> {
        {
            let names = self.object_class_names.lock().unwrap();
            if names.iter().any(|l| l == label) {
                return Err(EntwineError::Invariant(format!(
                    "dimension {label} already exists on class {}",
                    self.name
                )));
            }
        }
        {
            let mut values = self.parameter_values.lock().unwrap();
            let mut rekeyed: HashMap<Vec<Thing>, ParameterEntry, OtherHasher> = HashMap::default();
            for (key, entry) in values.iter() {
                let mut new_key = key.clone();
                new_key.push(object.object());
                if rekeyed.insert(new_key, entry.clone()).is_some() {
                    return Err(EntwineError::Invariant(format!(
                        "duplicate parameter value key after adding dimension {label} to class {}",
                        self.name
                    )));
                }
            }
            *values = rekeyed;
        }
        self.object_class_names
            .lock()
            .unwrap()
            .push(label.to_string());
        self.intact_object_class_names
            .lock()
            .unwrap()
            .push(label.to_string());
        let row_count = {
            let mut rows = self.relationships.lock().unwrap();
            for row in rows.iter_mut() {
                row.push(Arc::clone(&object));
            }
            rows.len()
        };
        {
            let mut row_map = self.row_map.lock().unwrap();
            let mut column: HashMap<Thing, RoaringTreemap, ThingHasher> = HashMap::default();
            column.insert(object.object(), (0..row_count as u64).collect());
            row_map.insert(label.to_string(), column);
        }
        self.invalidate();
        info!(class = %self.name, label, object = %object, "dimension added");
        Ok(())
    }

    /// Stored value, else the class default, else nothing.
    pub fn effective_value(&self, key: &[Thing], parameter: &str) -> ParameterValue {
        if let Some(entry) = self.parameter_values.lock().unwrap().get(key) {
            if let Some(value) = entry.get(parameter) {
                return value.clone();
            }
        }
        self.default_value(parameter)
    }
    pub(crate) fn default_value(&self, parameter: &str) -> ParameterValue {
        self.parameter_defaults
            .lock()
            .unwrap()
            .get(parameter)
            .cloned()
            .unwrap_or(ParameterValue::Nothing)
    }
    pub(crate) fn stored_entities(&self, parameter: &str) -> Vec<Vec<Thing>> {
        self.parameter_values
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.contains_key(parameter))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn invalidate(&self) {
        self.memo.lock().unwrap().clear();
        self.lookup_cache.lock().unwrap().clear();
        debug!(class = %self.name, "filter caches invalidated");
    }
}

impl fmt::Display for RelationshipClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ------------- Parameter -------------
#[derive(Debug, Clone)]
pub enum ClassRef {
    Object(Arc<ObjectClass>),
    Relationship(Arc<RelationshipClass>),
}

impl ClassRef {
    pub fn name(&self) -> &str {
        match self {
            ClassRef::Object(oc) => oc.name(),
            ClassRef::Relationship(rc) => rc.name(),
        }
    }
    pub fn labels(&self) -> Vec<String> {
        match self {
            ClassRef::Object(oc) => vec![oc.name().to_string()],
            ClassRef::Relationship(rc) => rc.object_class_names(),
        }
    }
    pub fn dimensionality(&self) -> usize {
        match self {
            ClassRef::Object(_) => 1,
            ClassRef::Relationship(rc) => rc.dimensionality(),
        }
    }
}

/// An entity a parameter is indexed by: an object of an object class or a
/// row of a relationship class.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Object(Arc<Object>),
    Tuple(Relationship),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Entity::Object(o) => write!(f, "{o}"),
            Entity::Tuple(r) => write!(f, "{r}"),
        }
    }
}

fn format_bindings(bindings: &[(&str, ObjectArg)]) -> String {
    let parts: Vec<String> = bindings
        .iter()
        .map(|(label, arg)| format!("{label}={arg}"))
        .collect();
    parts.join(", ")
}

/// A named attribute definable on one or more classes. Resolution picks the
/// class of greatest dimensionality whose labels are all bound.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    classes: Mutex<Vec<ClassRef>>,
    env: Mutex<HashSet<String, OtherHasher>>,
}

impl Parameter {
    pub fn new(name: &str) -> Arc<Parameter> {
        Arc::new(Parameter {
            name: name.to_string(),
            classes: Mutex::new(Vec::new()),
            env: Mutex::new(HashSet::default()),
        })
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn add_class(&self, class: ClassRef) {
        self.classes.lock().unwrap().push(class);
    }
    pub fn classes(&self) -> Vec<ClassRef> {
        self.classes.lock().unwrap().clone()
    }
    pub fn environments(&self) -> Vec<String> {
        self.env.lock().unwrap().iter().cloned().collect()
    }
    pub(crate) fn add_env(&self, env: &str) {
        self.env.lock().unwrap().insert(env.to_string());
    }

    // Picks the best class and resolves the stored value through the
    // defaults chain. Wildcard components match against stored keys and must
    // be unique; an ambiguous match resolves to nothing, silently.
    fn resolve(&self, bindings: &[(&str, ObjectArg)]) -> Option<ParameterValue> {
        let mut classes = self.classes.lock().unwrap().clone();
        classes.sort_by(|a, b| b.dimensionality().cmp(&a.dimensionality()));
        for class in classes {
            let labels = class.labels();
            let bound: Option<Vec<&ObjectArg>> = labels
                .iter()
                .map(|label| {
                    bindings
                        .iter()
                        .find(|(key, _)| *key == label.as_str())
                        .map(|(_, arg)| arg)
                })
                .collect();
            let args = match bound {
                Some(args) => args,
                None => continue,
            };
            let fully_specified: Option<Vec<Thing>> = args
                .iter()
                .map(|arg| match arg {
                    ObjectArg::One(o) => Some(o.object()),
                    _ => None,
                })
                .collect();
            let value = match (&class, fully_specified) {
                (ClassRef::Object(oc), Some(key)) => oc.effective_value(key[0], &self.name),
                (ClassRef::Relationship(rc), Some(key)) => rc.effective_value(&key, &self.name),
                (ClassRef::Object(oc), None) => {
                    let matches: Vec<Thing> = oc
                        .stored_entities(&self.name)
                        .into_iter()
                        .filter(|id| args[0].admits_id(*id))
                        .collect();
                    match matches.len() {
                        1 => oc.effective_value(matches[0], &self.name),
                        0 => oc.default_value(&self.name),
                        _ => {
                            debug!(parameter = %self.name, "ambiguous wildcard lookup");
                            ParameterValue::Nothing
                        }
                    }
                }
                (ClassRef::Relationship(rc), None) => {
                    let matches: Vec<Vec<Thing>> = rc
                        .stored_entities(&self.name)
                        .into_iter()
                        .filter(|key| {
                            key.iter()
                                .zip(args.iter())
                                .all(|(id, arg)| arg.admits_id(*id))
                        })
                        .collect();
                    match matches.len() {
                        1 => rc.effective_value(&matches[0], &self.name),
                        0 => rc.default_value(&self.name),
                        _ => {
                            debug!(parameter = %self.name, "ambiguous wildcard lookup");
                            ParameterValue::Nothing
                        }
                    }
                }
            };
            return Some(value);
        }
        None
    }

    /// Strict evaluation: no matching class is an error.
    pub fn value(&self, bindings: &[(&str, ObjectArg)], args: &CallArgs) -> Result<ParameterValue> {
        self.value_with(bindings, args, None)
    }
    pub fn value_with(
        &self,
        bindings: &[(&str, ObjectArg)],
        args: &CallArgs,
        observer: Option<&Observer>,
    ) -> Result<ParameterValue> {
        match self.resolve(bindings) {
            Some(value) => Ok(value.call(args, observer)),
            None => Err(EntwineError::NotFound {
                parameter: self.name.clone(),
                args: format_bindings(bindings),
            }),
        }
    }
    /// Lenient evaluation: no matching class yields the supplied default.
    pub fn value_or(
        &self,
        bindings: &[(&str, ObjectArg)],
        args: &CallArgs,
        default: ParameterValue,
    ) -> ParameterValue {
        match self.resolve(bindings) {
            Some(value) => value.call(args, None),
            None => default,
        }
    }

    fn for_each_index(
        &self,
        bindings: &[(&str, ObjectArg)],
        mut visit: impl FnMut(&ClassRef, Entity),
    ) {
        for class in self.classes.lock().unwrap().iter() {
            match class {
                ClassRef::Object(oc) => {
                    let constraint = bindings
                        .iter()
                        .find(|(key, _)| *key == oc.name())
                        .map(|(_, arg)| arg);
                    for object in oc.objects() {
                        if let Some(arg) = constraint {
                            if !arg.admits(&object) {
                                continue;
                            }
                        }
                        if !oc.effective_value(object.object(), &self.name).is_nothing() {
                            visit(class, Entity::Object(object));
                        }
                    }
                }
                ClassRef::Relationship(rc) => {
                    let labels = rc.object_class_names();
                    for relationship in rc.relationships() {
                        let admitted = labels.iter().zip(relationship.objects().iter()).all(
                            |(label, object)| {
                                match bindings.iter().find(|(key, _)| *key == label.as_str()) {
                                    Some((_, arg)) => arg.admits(object),
                                    None => true,
                                }
                            },
                        );
                        if admitted
                            && !rc
                                .effective_value(&relationship.key(), &self.name)
                                .is_nothing()
                        {
                            visit(class, Entity::Tuple(relationship));
                        }
                    }
                }
            }
        }
    }

    /// Every entity whose resolved value is not nothing, optionally
    /// constrained per dimension.
    pub fn indices(&self, bindings: &[(&str, ObjectArg)]) -> Vec<Entity> {
        let mut out = Vec::new();
        self.for_each_index(bindings, |_, entity| out.push(entity));
        out
    }

    /// Like [`Parameter::indices`], with object-class entities wrapped as
    /// one-dimensional tuples labeled by their class.
    pub fn indices_as_tuples(&self, bindings: &[(&str, ObjectArg)]) -> Vec<Relationship> {
        let mut out = Vec::new();
        self.for_each_index(bindings, |class, entity| {
            out.push(match entity {
                Entity::Object(object) => {
                    Relationship::new(vec![class.name().to_string()], vec![object])
                }
                Entity::Tuple(relationship) => relationship,
            })
        });
        out
    }

    /// The maximum over all indexed entities, recursing into containers and
    /// skipping NaN; periods rank by their upper bounds.
    pub fn maximum_value(&self) -> Option<Scalar> {
        let mut best: Option<(f64, Scalar)> = None;
        self.for_each_index(&[], |class, entity| {
            let value = match (class, &entity) {
                (ClassRef::Object(oc), Entity::Object(o)) => {
                    oc.effective_value(o.object(), &self.name)
                }
                (ClassRef::Relationship(rc), Entity::Tuple(r)) => {
                    rc.effective_value(&r.key(), &self.name)
                }
                _ => ParameterValue::Nothing,
            };
            fold_maximum(&value, &mut best);
        });
        best.map(|(_, scalar)| scalar)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// Free-function spellings of the parameter queries.
pub fn indices(parameter: &Parameter, bindings: &[(&str, ObjectArg)]) -> Vec<Entity> {
    parameter.indices(bindings)
}

pub fn indices_as_tuples(
    parameter: &Parameter,
    bindings: &[(&str, ObjectArg)],
) -> Vec<Relationship> {
    parameter.indices_as_tuples(bindings)
}

pub fn maximum_parameter_value(parameter: &Parameter) -> Option<Scalar> {
    parameter.maximum_value()
}
