pub mod change;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod key;
pub mod lookup;
pub mod normalize;
pub mod plan;
pub mod row;
pub mod schema;

pub use change::{ChangeKind, ChangeRecord, DuplicateKeyWarning, FieldChange, MissingRow};
pub use error::CoreError;
pub use field_value::{FieldType, FieldValue};
pub use ids::*;
pub use key::NaturalKey;
pub use lookup::{LookupTable, LookupTables};
pub use plan::{WriteBatch, WriteKind, WriteOp, WritePlan};
pub use row::{FlatRow, PriorEntry};
pub use schema::{FieldSpec, RelationSchema, SchemaForest};
