/// Arrow schema definitions for the persisted Parcelle tables.
///
/// Geometries are stored as GeoJSON-like serde text next to their bounding
/// box, so backends can prefilter in SQL and run the exact predicate in Rust.
pub mod tables {
    use arrow::datatypes::{DataType, Field, Schema};

    /// A table: its Arrow schema and the columns of its unique key.
    #[derive(Debug, Clone)]
    pub struct TableDef {
        pub name: &'static str,
        pub schema: Schema,
        pub key: &'static [&'static str],
    }

    fn bbox_fields() -> [Field; 4] {
        [
            Field::new("xmin", DataType::Float64, false),
            Field::new("ymin", DataType::Float64, false),
            Field::new("xmax", DataType::Float64, false),
            Field::new("ymax", DataType::Float64, false),
        ]
    }

    /// Cadastral zoning polygons.
    pub fn zones() -> TableDef {
        let mut fields = vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("code_norm", DataType::Utf8, false),
            Field::new("commune_id", DataType::Utf8, false),
            Field::new("geometry", DataType::Utf8, false),
        ];
        fields.extend(bbox_fields());
        TableDef {
            name: "zones",
            schema: Schema::new(fields),
            key: &["id"],
        }
    }

    /// Regulation rows. Append-only; the value lives in exactly one of
    /// `value_num`, `value_text`, `value_json`.
    pub fn rule_definitions() -> TableDef {
        TableDef {
            name: "rule_definitions",
            schema: Schema::new(vec![
                Field::new("zone_id", DataType::Utf8, false),
                Field::new("level", DataType::Int32, false),
                Field::new("field", DataType::Utf8, false),
                Field::new("value_num", DataType::Float64, true),
                Field::new("value_text", DataType::Utf8, true),
                Field::new("value_json", DataType::Utf8, true),
                Field::new("description", DataType::Utf8, true),
                Field::new("source_id", DataType::Utf8, true),
                Field::new("validity_from", DataType::Date32, false),
                Field::new("validity_to", DataType::Date32, true),
            ]),
            key: &["zone_id", "field", "level", "validity_from"],
        }
    }

    pub fn regulation_sources() -> TableDef {
        TableDef {
            name: "regulation_sources",
            schema: Schema::new(vec![
                Field::new("id", DataType::Utf8, false),
                Field::new("pdf_path", DataType::Utf8, false),
                Field::new("article_ref", DataType::Utf8, true),
                Field::new("ocr_confidence", DataType::Float64, true),
            ]),
            key: &["id"],
        }
    }

    /// Registered context layers; `definition` is the serialised layer.
    pub fn context_layers() -> TableDef {
        TableDef {
            name: "context_layers",
            schema: Schema::new(vec![
                Field::new("id", DataType::Utf8, false),
                Field::new("name", DataType::Utf8, false),
                Field::new("definition", DataType::Utf8, false),
            ]),
            key: &["id"],
        }
    }

    pub fn layer_features() -> TableDef {
        let mut fields = vec![
            Field::new("layer_id", DataType::Utf8, false),
            Field::new("seq", DataType::Int32, false),
            Field::new("geometry", DataType::Utf8, false),
            Field::new("value_num", DataType::Float64, true),
            Field::new("value_text", DataType::Utf8, true),
        ];
        fields.extend(bbox_fields());
        TableDef {
            name: "layer_features",
            schema: Schema::new(fields),
            key: &["layer_id", "seq"],
        }
    }

    /// ContextFlag cache. `computed_at` is unix milliseconds (UTC).
    pub fn parcel_context() -> TableDef {
        TableDef {
            name: "parcel_context",
            schema: Schema::new(vec![
                Field::new("parcel_id", DataType::Utf8, false),
                Field::new("layer_id", DataType::Utf8, false),
                Field::new("layer_name", DataType::Utf8, false),
                Field::new("intersects", DataType::Boolean, false),
                Field::new("severity", DataType::Int32, false),
                Field::new("value_num", DataType::Float64, true),
                Field::new("value_text", DataType::Utf8, true),
                Field::new("distance_m", DataType::Float64, true),
                Field::new("message", DataType::Utf8, false),
                Field::new("computed_at", DataType::Int64, false),
            ]),
            key: &["parcel_id", "layer_id"],
        }
    }

    pub fn evidence_items() -> TableDef {
        TableDef {
            name: "evidence_items",
            schema: Schema::new(vec![
                Field::new("parcel_id", DataType::Utf8, false),
                Field::new("ref_type", DataType::Utf8, false),
                Field::new("field", DataType::Utf8, false),
                Field::new("source_path", DataType::Utf8, false),
                Field::new("value_num", DataType::Float64, true),
                Field::new("value_text", DataType::Utf8, true),
                Field::new("reliability", DataType::Utf8, false),
                Field::new("comment", DataType::Utf8, false),
                Field::new("metadata", DataType::Utf8, false),
                Field::new("inserted_by", DataType::Utf8, false),
            ]),
            key: &["parcel_id", "ref_type", "field", "source_path"],
        }
    }

    /// Per-parcel quality; `details` is a JSON object field → weight.
    pub fn analysis_quality() -> TableDef {
        TableDef {
            name: "analysis_quality",
            schema: Schema::new(vec![
                Field::new("parcel_id", DataType::Utf8, false),
                Field::new("calc_date", DataType::Date32, false),
                Field::new("score_global", DataType::Float64, false),
                Field::new("score_calculations", DataType::Float64, false),
                Field::new("total_fields", DataType::Int32, false),
                Field::new("direct_count", DataType::Int32, false),
                Field::new("derived_count", DataType::Int32, false),
                Field::new("estimated_count", DataType::Int32, false),
                Field::new("missing_count", DataType::Int32, false),
                Field::new("details", DataType::Utf8, false),
            ]),
            key: &["parcel_id", "calc_date"],
        }
    }

    /// Every table, in creation order.
    pub fn all() -> Vec<TableDef> {
        vec![
            zones(),
            rule_definitions(),
            regulation_sources(),
            context_layers(),
            layer_features(),
            parcel_context(),
            evidence_items(),
            analysis_quality(),
        ]
    }

    fn sql_type(dt: &DataType) -> &'static str {
        match dt {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INTEGER",
            DataType::Int64 => "BIGINT",
            DataType::Float64 => "DOUBLE",
            DataType::Date32 => "DATE",
            _ => "VARCHAR",
        }
    }

    impl TableDef {
        /// `CREATE TABLE IF NOT EXISTS` with the unique key as primary key.
        pub fn create_sql(&self) -> String {
            let mut cols: Vec<String> = self
                .schema
                .fields()
                .iter()
                .map(|f| {
                    let null = if f.is_nullable() { "" } else { " NOT NULL" };
                    format!("{} {}{null}", f.name(), sql_type(f.data_type()))
                })
                .collect();
            cols.push(format!("PRIMARY KEY ({})", self.key.join(", ")));
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                self.name,
                cols.join(", ")
            )
        }
    }
}
