//! Static per-backend feature flags
//!
//! Callers consult these before invoking optional contract operations instead
//! of probing for `NotSupported` errors.

use serde::Serialize;

use crate::engine::types::{CancelSupport, FilterOperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub transactions: bool,
    pub mutations: bool,
    pub streaming: bool,
    pub multi_row_insert: bool,
    pub cancel: CancelSupport,
    pub schemas: bool,
    pub views: bool,
    pub materialized_views: bool,
    pub routines: bool,
    pub triggers: bool,
    pub indexes: bool,
    pub foreign_keys: bool,
    pub partitions: bool,
    pub comments: bool,
    pub alter_table: bool,
    pub alter_relation: bool,
    pub truncate: bool,
    pub duplicate_table: bool,
    pub filter_types: &'static [FilterOperator],
}

const SQL_FILTERS: &[FilterOperator] = &[
    FilterOperator::Equals,
    FilterOperator::NotEquals,
    FilterOperator::GreaterThan,
    FilterOperator::GreaterOrEqual,
    FilterOperator::LessThan,
    FilterOperator::LessOrEqual,
    FilterOperator::Like,
    FilterOperator::In,
    FilterOperator::IsNull,
    FilterOperator::IsNotNull,
];

const POSTGRES_FILTERS: &[FilterOperator] = &[
    FilterOperator::Equals,
    FilterOperator::NotEquals,
    FilterOperator::GreaterThan,
    FilterOperator::GreaterOrEqual,
    FilterOperator::LessThan,
    FilterOperator::LessOrEqual,
    FilterOperator::Like,
    FilterOperator::ILike,
    FilterOperator::In,
    FilterOperator::IsNull,
    FilterOperator::IsNotNull,
];

const DOCUMENT_FILTERS: &[FilterOperator] = &[
    FilterOperator::Equals,
    FilterOperator::NotEquals,
    FilterOperator::GreaterThan,
    FilterOperator::GreaterOrEqual,
    FilterOperator::LessThan,
    FilterOperator::LessOrEqual,
    FilterOperator::In,
    FilterOperator::IsNull,
    FilterOperator::IsNotNull,
];

impl Capabilities {
    /// Nothing beyond plain query execution.
    pub const MINIMAL: Capabilities = Capabilities {
        transactions: false,
        mutations: false,
        streaming: false,
        multi_row_insert: false,
        cancel: CancelSupport::None,
        schemas: false,
        views: false,
        materialized_views: false,
        routines: false,
        triggers: false,
        indexes: false,
        foreign_keys: false,
        partitions: false,
        comments: false,
        alter_table: false,
        alter_relation: false,
        truncate: false,
        duplicate_table: false,
        filter_types: &[],
    };

    pub const POSTGRES: Capabilities = Capabilities {
        transactions: true,
        mutations: true,
        streaming: true,
        multi_row_insert: true,
        cancel: CancelSupport::Driver,
        schemas: true,
        views: true,
        materialized_views: true,
        routines: true,
        triggers: true,
        indexes: true,
        foreign_keys: true,
        partitions: true,
        comments: true,
        alter_table: true,
        alter_relation: true,
        truncate: true,
        duplicate_table: true,
        filter_types: POSTGRES_FILTERS,
    };

    pub const MYSQL: Capabilities = Capabilities {
        transactions: true,
        mutations: true,
        streaming: true,
        multi_row_insert: true,
        cancel: CancelSupport::Driver,
        schemas: false,
        views: true,
        materialized_views: false,
        routines: true,
        triggers: true,
        indexes: true,
        foreign_keys: true,
        partitions: true,
        comments: true,
        alter_table: true,
        alter_relation: true,
        truncate: true,
        duplicate_table: true,
        filter_types: SQL_FILTERS,
    };

    pub const SQLITE: Capabilities = Capabilities {
        transactions: true,
        mutations: true,
        streaming: true,
        multi_row_insert: true,
        cancel: CancelSupport::None,
        schemas: false,
        views: true,
        materialized_views: false,
        routines: false,
        triggers: true,
        indexes: true,
        foreign_keys: true,
        partitions: false,
        comments: false,
        alter_table: true,
        alter_relation: false,
        truncate: true,
        duplicate_table: true,
        filter_types: SQL_FILTERS,
    };

    pub const MONGODB: Capabilities = Capabilities {
        transactions: false,
        mutations: true,
        streaming: true,
        multi_row_insert: true,
        cancel: CancelSupport::None,
        schemas: false,
        views: true,
        materialized_views: false,
        routines: false,
        triggers: false,
        indexes: true,
        foreign_keys: false,
        partitions: false,
        comments: false,
        alter_table: false,
        alter_relation: false,
        truncate: true,
        duplicate_table: true,
        filter_types: DOCUMENT_FILTERS,
    };

    pub fn supports_filter(&self, operator: FilterOperator) -> bool {
        self.filter_types.contains(&operator)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::MINIMAL
    }
}
