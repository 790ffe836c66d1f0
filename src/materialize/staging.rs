// ABOUTME: Staging plan for a changeset - column typing, key deduplication and SQL generation
// ABOUTME: Pure functions only; execution lives in the PostgreSQL materializer

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_postgres::types::ToSql;

use crate::changeset::{ChangeKind, ChangeRecord, GeometryKind, RawValue};
use crate::utils::{quote_ident, quote_literal};

/// Reserved staging column holding the change indicator.
pub const CHANGE_COLUMN: &str = "__change__";
/// Reserved staging column holding the record ordinal.
pub const ORDINAL_COLUMN: &str = "__ordinal__";
/// Reserved staging column holding geometry WKT before conversion.
pub const WKT_COLUMN: &str = "__shape_wkt__";

/// PostgreSQL parameter limit is 65535 per statement; leave some margin.
const MAX_PARAMS_PER_STATEMENT: usize = 65000;

/// Staging column type, widened across all values observed in a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Timestamp,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Text => "TEXT",
        }
    }

    fn of(value: &RawValue) -> Option<Self> {
        match value {
            RawValue::Null => None,
            RawValue::Integer(_) => Some(ColumnType::BigInt),
            RawValue::Float(_) => Some(ColumnType::Double),
            RawValue::Timestamp(_) => Some(ColumnType::Timestamp),
            RawValue::Text(_) => Some(ColumnType::Text),
        }
    }

    /// Narrowest type that holds values of both types.
    pub fn unify(self, other: Self) -> Self {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (BigInt, Double) | (Double, BigInt) => Double,
            _ => Text,
        }
    }

    /// Bind a value as a parameter of this column's type.
    fn param(&self, value: Option<&RawValue>) -> Box<dyn ToSql + Sync + Send> {
        let value = value.filter(|v| !v.is_null());
        match self {
            ColumnType::BigInt => Box::new(value.and_then(|v| match v {
                RawValue::Integer(i) => Some(*i),
                _ => None,
            })),
            ColumnType::Double => Box::new(value.and_then(|v| match v {
                RawValue::Integer(i) => Some(*i as f64),
                RawValue::Float(f) => Some(*f),
                _ => None,
            })),
            ColumnType::Timestamp => Box::new(value.and_then(|v| match v {
                RawValue::Timestamp(ts) => Some(*ts),
                _ => None::<DateTime<Utc>>,
            })),
            ColumnType::Text => Box::new(value.and_then(RawValue::as_key)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingColumn {
    pub name: String,
    pub ty: ColumnType,
}

/// Keep only the latest-ordinal record per key, in ordinal order.
///
/// A changeset may carry several operations for the same key; only the last
/// one describes the row's final state. Records without a key are all kept.
pub fn dedupe_latest<'a>(records: &'a [ChangeRecord], id_column: &str) -> Vec<&'a ChangeRecord> {
    let mut latest: HashMap<String, usize> = HashMap::new();
    for record in records {
        if let Some(key) = record.key(id_column) {
            let slot = latest.entry(key).or_insert(record.ordinal);
            *slot = (*slot).max(record.ordinal);
        }
    }

    let mut kept: Vec<&ChangeRecord> = records
        .iter()
        .filter(|record| match record.key(id_column) {
            Some(key) => latest.get(&key) == Some(&record.ordinal),
            None => true,
        })
        .collect();
    kept.sort_by_key(|record| record.ordinal);
    kept
}

/// Geometry handling derived from the kinds present in a changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryPlan {
    pub kinds: BTreeSet<GeometryKind>,
    pub srid: i32,
}

impl GeometryPlan {
    fn single_kind(&self) -> Option<GeometryKind> {
        match self.kinds.len() {
            1 => self.kinds.iter().next().copied(),
            _ => None,
        }
    }

    /// Column type in the staging table.
    pub fn staging_type(&self) -> String {
        let kind = self
            .single_kind()
            .map(|k| k.postgis_type())
            .unwrap_or("Geometry");
        format!("geometry({}, {})", kind, self.srid)
    }

    /// Column type used when the target table has no geometry column yet.
    pub fn target_type(&self) -> String {
        let kind = self
            .single_kind()
            .map(|k| k.target_postgis_type())
            .unwrap_or("Geometry");
        format!("geometry({}, {})", kind, self.srid)
    }

    /// Select expression moving staged geometry into the target column.
    pub fn insert_expression(&self, column: &str) -> String {
        let quoted = quote_ident(column);
        match self.single_kind() {
            Some(kind) if kind.needs_multi_wrap() => format!("ST_Multi({})", quoted),
            Some(_) => quoted,
            None => format!(
                "CASE WHEN GeometryType({col}) = 'POLYGON' THEN ST_Multi({col}) ELSE {col} END",
                col = quoted
            ),
        }
    }
}

/// Everything needed to stage one changeset.
#[derive(Debug, Clone)]
pub struct StagingPlan {
    pub table: String,
    pub columns: Vec<StagingColumn>,
    pub geometry_column: String,
    pub geometry: Option<GeometryPlan>,
}

impl StagingPlan {
    /// Derive staging columns from the records' attributes.
    ///
    /// Attribute names colliding with reserved or geometry columns are dropped.
    pub fn build(
        table: &str,
        records: &[&ChangeRecord],
        geometry_column: &str,
        srid: i32,
    ) -> Self {
        let mut types: BTreeMap<&str, Option<ColumnType>> = BTreeMap::new();
        for record in records {
            for (name, value) in &record.attributes {
                let slot = types.entry(name.as_str()).or_insert(None);
                if let Some(ty) = ColumnType::of(value) {
                    *slot = Some(match *slot {
                        Some(existing) => existing.unify(ty),
                        None => ty,
                    });
                }
            }
        }

        let reserved = [CHANGE_COLUMN, ORDINAL_COLUMN, WKT_COLUMN, geometry_column];
        let columns = types
            .into_iter()
            .filter(|(name, _)| {
                let clash = reserved.iter().any(|r| r.eq_ignore_ascii_case(name));
                if clash {
                    tracing::warn!("Dropping attribute '{}': name is reserved for staging", name);
                }
                !clash
            })
            .map(|(name, ty)| StagingColumn {
                name: name.to_string(),
                ty: ty.unwrap_or(ColumnType::Text),
            })
            .collect();

        let kinds: BTreeSet<GeometryKind> = records
            .iter()
            .filter_map(|r| r.geometry.as_ref().map(|g| g.kind))
            .collect();
        let geometry = (!kinds.is_empty()).then_some(GeometryPlan { kinds, srid });

        Self {
            table: table.to_string(),
            columns,
            geometry_column: geometry_column.to_string(),
            geometry,
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Column names in staging insert order.
    fn insert_columns(&self) -> Vec<&str> {
        let mut names = vec![ORDINAL_COLUMN, CHANGE_COLUMN];
        names.extend(self.columns.iter().map(|c| c.name.as_str()));
        if self.geometry.is_some() {
            names.push(WKT_COLUMN);
        }
        names
    }

    pub fn params_per_row(&self) -> usize {
        self.insert_columns().len()
    }

    /// Rows per staging INSERT so a statement stays under the parameter limit.
    pub fn batch_size(&self) -> usize {
        std::cmp::max(1, MAX_PARAMS_PER_STATEMENT / self.params_per_row())
    }

    pub fn create_sql(&self) -> String {
        let mut defs = vec![
            format!("{} BIGINT NOT NULL", quote_ident(ORDINAL_COLUMN)),
            format!("{} TEXT NOT NULL", quote_ident(CHANGE_COLUMN)),
        ];
        defs.extend(
            self.columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql())),
        );
        if self.geometry.is_some() {
            defs.push(format!("{} TEXT", quote_ident(WKT_COLUMN)));
        }
        format!(
            "CREATE TEMP TABLE {} ({})",
            quote_ident(&self.table),
            defs.join(", ")
        )
    }

    /// Multi-row INSERT into the staging table:
    /// ```sql
    /// INSERT INTO "staging" ("__ordinal__", "__change__", "a") VALUES ($1, $2, $3), ($4, $5, $6)
    /// ```
    pub fn insert_sql(&self, num_rows: usize) -> String {
        let columns = self.insert_columns();
        let num_cols = columns.len();
        let value_rows: Vec<String> = (0..num_rows)
            .map(|row_idx| {
                let placeholders: Vec<String> = (0..num_cols)
                    .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

        format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(&self.table),
            quoted.join(", "),
            value_rows.join(", ")
        )
    }

    /// Parameter values for one record, matching [`insert_sql`](Self::insert_sql).
    pub fn row_params(&self, record: &ChangeRecord) -> Vec<Box<dyn ToSql + Sync + Send>> {
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(self.params_per_row());
        params.push(Box::new(record.ordinal as i64));
        params.push(Box::new(record.change_kind.as_str().to_string()));
        for column in &self.columns {
            params.push(column.ty.param(record.attributes.get(&column.name)));
        }
        if self.geometry.is_some() {
            params.push(Box::new(record.geometry.as_ref().map(|g| g.wkt.clone())));
        }
        params
    }

    /// `ALTER TABLE` adding the typed geometry column to staging.
    pub fn add_geometry_sql(&self) -> Option<String> {
        self.geometry.as_ref().map(|geometry| {
            format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(&self.table),
                quote_ident(&self.geometry_column),
                geometry.staging_type()
            )
        })
    }

    /// `UPDATE` converting staged WKT into the geometry column.
    pub fn populate_geometry_sql(&self) -> Option<String> {
        self.geometry.as_ref().map(|geometry| {
            format!(
                "UPDATE {table} SET {geom} = ST_GeomFromText({wkt}, {srid}) WHERE {wkt} IS NOT NULL",
                table = quote_ident(&self.table),
                geom = quote_ident(&self.geometry_column),
                wkt = quote_ident(WKT_COLUMN),
                srid = geometry.srid
            )
        })
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_ident(&self.table))
    }
}

/// Target table layout as read from the catalog: (column, formatted type).
pub type TargetColumns = Vec<(String, String)>;

/// Type of `column` in the target, if present.
pub fn target_column_type<'a>(target: &'a TargetColumns, column: &str) -> Option<&'a str> {
    target
        .iter()
        .find(|(name, _)| name == column)
        .map(|(_, ty)| ty.as_str())
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// `ALTER TABLE` adding the geometry column to a target that lacks one.
pub fn ensure_target_geometry_sql(
    schema: &str,
    table: &str,
    plan: &StagingPlan,
) -> Option<String> {
    plan.geometry.as_ref().map(|geometry| {
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            qualified(schema, table),
            quote_ident(&plan.geometry_column),
            geometry.target_type()
        )
    })
}

/// Delete every target row whose key appears in staging.
///
/// Staged keys are cast to the target key type so the key index stays usable.
pub fn delete_sql(
    schema: &str,
    table: &str,
    id_column: &str,
    id_type: &str,
    plan: &StagingPlan,
) -> String {
    let id = quote_ident(id_column);
    format!(
        "DELETE FROM {target} WHERE {id} IN (SELECT CAST({id} AS {ty}) FROM {staging} WHERE {id} IS NOT NULL)",
        target = qualified(schema, table),
        id = id,
        ty = id_type,
        staging = quote_ident(&plan.table)
    )
}

/// Insert non-delete staged rows into the target, in ordinal order.
///
/// Only attribute columns the target has are copied, each cast to the
/// target column type. Returns `None` when nothing would be inserted.
pub fn insert_target_sql(
    schema: &str,
    table: &str,
    plan: &StagingPlan,
    target: &TargetColumns,
) -> Option<String> {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for column in &plan.columns {
        match target_column_type(target, &column.name) {
            Some(ty) => {
                columns.push(quote_ident(&column.name));
                values.push(format!("CAST({} AS {})", quote_ident(&column.name), ty));
            }
            None => tracing::warn!(
                "Column '{}' is not present in {}.{}, skipping",
                column.name,
                schema,
                table
            ),
        }
    }
    if let Some(geometry) = &plan.geometry {
        columns.push(quote_ident(&plan.geometry_column));
        values.push(geometry.insert_expression(&plan.geometry_column));
    }
    if columns.is_empty() {
        return None;
    }

    Some(format!(
        "INSERT INTO {target} ({columns}) SELECT {values} FROM {staging} WHERE {change} <> {delete} ORDER BY {ordinal}",
        target = qualified(schema, table),
        columns = columns.join(", "),
        values = values.join(", "),
        staging = quote_ident(&plan.table),
        change = quote_ident(CHANGE_COLUMN),
        delete = quote_literal(ChangeKind::Delete.as_str()),
        ordinal = quote_ident(ORDINAL_COLUMN)
    ))
}
