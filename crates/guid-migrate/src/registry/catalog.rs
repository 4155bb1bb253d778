//! Built-in table catalogue.

use crate::core::schema::{ColumnType, TableDescriptor};

/// Every migratable table of the standard schema, Core first, then LabDE.
pub fn standard_tables() -> Vec<TableDescriptor> {
    use ColumnType::*;

    vec![
        // Global settings: keys are fixed by the schema, only values move.
        // Rows are matched by guid, so installations created independently
        // share no settings rows and an import into one fails unless the
        // destination was restored from the same lineage. Export leaves this
        // table out unless `include_fixed_vocabulary` is set.
        TableDescriptor::new("db_info")
            .column("name", Text)
            .nullable_column("value", Text)
            .fixed_vocabulary(),
        TableDescriptor::new("login")
            .column("user_name", Text)
            .nullable_column("password_hash", Text)
            .column("is_admin", Bool),
        TableDescriptor::new("fam_user")
            .column("user_name", Text)
            .nullable_column("full_name", Text)
            .nullable_column("email", Text),
        TableDescriptor::new("workflow")
            .column("name", Text)
            .nullable_column("description", Text)
            .column("workflow_type", Int)
            .nullable_column("document_folder", Text)
            .column("load_balance_weight", Int)
            .column("enable_load_balancing", Bool),
        TableDescriptor::new("action")
            .column("name", Text)
            .nullable_column("description", Text)
            .column("main_sequence", Bool)
            .optionally_references("workflow_id", "workflow"),
        TableDescriptor::new("tag")
            .column("name", Text)
            .nullable_column("description", Text),
        TableDescriptor::new("metadata_field").column("name", Text),
        TableDescriptor::new("attribute_set_name")
            .column("description", Text)
            .column("store_spatial_info", Bool),
        TableDescriptor::new("user_counter")
            .column("counter_name", Text)
            .column("value", BigInt),
        TableDescriptor::new("database_service")
            .column("description", Text)
            .nullable_column("settings", Text)
            .column("enabled", Bool),
        TableDescriptor::new("dashboard")
            .column("name", Text)
            .nullable_column("definition", Text)
            .nullable_column("last_imported_date", Timestamp)
            .column("use_extracted_data", Bool)
            .optionally_references("fam_user_id", "fam_user"),
        TableDescriptor::new("web_app_config")
            .column("config_type", Text)
            .nullable_column("settings", Text)
            .references("workflow_id", "workflow"),
        // LabDE
        TableDescriptor::new("labde_patient")
            .column("mrn", Text)
            .nullable_column("first_name", Text)
            .nullable_column("middle_name", Text)
            .nullable_column("last_name", Text)
            .nullable_column("suffix", Text)
            .nullable_column("dob", Date)
            .nullable_column("gender", Text)
            .column("active", Bool)
            .optionally_references("merged_into", "labde_patient")
            .labde(),
        TableDescriptor::new("labde_provider")
            .nullable_column("first_name", Text)
            .nullable_column("last_name", Text)
            .nullable_column("provider_type", Text)
            .column("code", Text)
            .column("inactive", Bool)
            .labde(),
        TableDescriptor::new("labde_encounter")
            .column("csn", Text)
            .nullable_column("department", Text)
            .nullable_column("encounter_date", Timestamp)
            .nullable_column("encounter_type", Text)
            .nullable_column("encounter_provider", Text)
            .nullable_column("admission_date", Timestamp)
            .nullable_column("discharge_date", Timestamp)
            .references("patient_id", "labde_patient")
            .labde(),
        TableDescriptor::new("labde_order")
            .column("order_number", Text)
            .nullable_column("order_code", Text)
            .nullable_column("request_date", Timestamp)
            .nullable_column("order_status", Text)
            .nullable_column("reference_date", Timestamp)
            .references("patient_id", "labde_patient")
            .optionally_references("encounter_id", "labde_encounter")
            .labde(),
    ]
}
