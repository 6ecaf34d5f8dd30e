//! Built-in migration plan for the spatial, time-series and vector demo schema.
//!
//! Steps that need an extension declare it, and steps that alter an earlier
//! step's table declare that step as a predecessor. With an extension
//! disabled, its steps stay blocked while the rest of the schema is applied.

use pgforge_core::capability::CapabilityName;
use pgforge_core::plan::{MigrationPlan, MigrationStep, Postcondition};
use pgforge_core::Result;

/// Returns the built-in plan.
///
/// # Errors
///
/// Returns [`Error::InvalidPlan`] if the built-in steps break the ordering
/// rules.
///
/// [`Error::InvalidPlan`]: pgforge_core::Error::InvalidPlan
pub fn default_plan() -> Result<MigrationPlan> {
    MigrationPlan::new(default_steps())
}

/// Returns the built-in steps in declared order.
pub fn default_steps() -> Vec<MigrationStep> {
    vec![
        spatial_tables(),
        sensor_readings(),
        hypertable(3, "sensor_readings", "time", 2, &[
            "sensor_readings_sensor_id_time_idx ON sensor_readings (sensor_id, time)",
        ]),
        metric_data(),
        hypertable(5, "metric_data", "timestamp", 4, &[
            "metric_data_metric_name_idx ON metric_data (metric_name)",
        ]),
        documents(),
        document_embedding(),
        document_embedding_index(),
        image_embeddings(),
        items(),
    ]
}

fn spatial_tables() -> MigrationStep {
    MigrationStep::new(
        1,
        "Create places, routes and regions with geometry columns",
        "CREATE TABLE places (
            id          BIGSERIAL PRIMARY KEY,
            name        VARCHAR(200) NOT NULL,
            location    geometry(Point, 4326) NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX places_location_idx ON places USING gist (location);
        CREATE TABLE routes (
            id          BIGSERIAL PRIMARY KEY,
            name        VARCHAR(200) NOT NULL,
            path        geometry(LineString, 4326) NOT NULL,
            distance_km DOUBLE PRECISION
        );
        CREATE TABLE regions (
            id          BIGSERIAL PRIMARY KEY,
            name        VARCHAR(200) NOT NULL,
            boundary    geometry(Polygon, 4326) NOT NULL,
            area_sq_km  DOUBLE PRECISION
        );",
    )
    .with_reverse("DROP TABLE regions; DROP TABLE routes; DROP TABLE places;")
    .requires(CapabilityName::spatial())
    .expects(Postcondition::table("places"))
    .expects(Postcondition::table("routes"))
    .expects(Postcondition::table("regions"))
    .expects(Postcondition::index("places_location_idx"))
}

fn sensor_readings() -> MigrationStep {
    MigrationStep::new(
        2,
        "Create sensor_readings",
        "CREATE TABLE sensor_readings (
            time        TIMESTAMPTZ PRIMARY KEY,
            sensor_id   VARCHAR(50) NOT NULL,
            temperature DOUBLE PRECISION NOT NULL,
            humidity    DOUBLE PRECISION NOT NULL,
            pressure    DOUBLE PRECISION
        );
        CREATE INDEX sensor_readings_sensor_id_time_idx ON sensor_readings (sensor_id, time);",
    )
    .with_reverse("DROP TABLE sensor_readings;")
    .expects(Postcondition::table("sensor_readings"))
    .expects(Postcondition::index("sensor_readings_sensor_id_time_idx"))
}

fn metric_data() -> MigrationStep {
    MigrationStep::new(
        4,
        "Create metric_data",
        "CREATE TABLE metric_data (
            timestamp   TIMESTAMPTZ PRIMARY KEY,
            metric_name VARCHAR(100) NOT NULL,
            value       DOUBLE PRECISION NOT NULL,
            tags        JSONB NOT NULL DEFAULT '{}'::jsonb
        );
        CREATE INDEX metric_data_metric_name_idx ON metric_data (metric_name);",
    )
    .with_reverse("DROP TABLE metric_data;")
    .expects(Postcondition::table("metric_data"))
    .expects(Postcondition::index("metric_data_metric_name_idx"))
}

/// Converts `table` into a hypertable partitioned on `column`.
///
/// The reverse copies the rows into a plain table of the same shape and
/// recreates the primary key and the given named indexes of the base step.
fn hypertable(id: u32, table: &str, column: &str, base: u32, indexes: &[&str]) -> MigrationStep {
    let forward = format!("SELECT create_hypertable('{table}', '{column}', if_not_exists => TRUE);");

    let mut reverse = format!(
        "CREATE TABLE {table}_plain (LIKE {table} INCLUDING DEFAULTS INCLUDING CONSTRAINTS);
        INSERT INTO {table}_plain SELECT * FROM {table};
        DROP TABLE {table};
        ALTER TABLE {table}_plain RENAME TO {table};
        ALTER TABLE {table} ADD PRIMARY KEY ({column});"
    );
    for index in indexes {
        reverse.push_str(&format!("\nCREATE INDEX {index};"));
    }

    MigrationStep::new(id, format!("Convert {table} to a hypertable"), forward)
        .with_reverse(reverse)
        .requires(CapabilityName::time_series())
        .after(base)
        .expects(Postcondition::hypertable(table))
}

fn documents() -> MigrationStep {
    MigrationStep::new(
        6,
        "Create documents",
        "CREATE TABLE documents (
            id         BIGSERIAL PRIMARY KEY,
            title      VARCHAR(500) NOT NULL,
            content    TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );",
    )
    .with_reverse("DROP TABLE documents;")
    .expects(Postcondition::table("documents"))
}

fn document_embedding() -> MigrationStep {
    MigrationStep::new(
        7,
        "Add a 1536-dimension embedding to documents",
        "ALTER TABLE documents ADD COLUMN embedding vector(1536);",
    )
    .with_reverse("ALTER TABLE documents DROP COLUMN embedding;")
    .requires(CapabilityName::vector())
    .after(6)
    .expects(Postcondition::column("documents", "embedding"))
}

fn document_embedding_index() -> MigrationStep {
    MigrationStep::new(
        8,
        "Create an HNSW cosine index on documents.embedding",
        "CREATE INDEX documents_embedding_idx ON documents
            USING hnsw (embedding vector_cosine_ops)
            WITH (m = 16, ef_construction = 64);",
    )
    .with_reverse("DROP INDEX documents_embedding_idx;")
    .requires(CapabilityName::vector())
    .after(7)
    .expects(Postcondition::index("documents_embedding_idx"))
}

fn image_embeddings() -> MigrationStep {
    MigrationStep::new(
        9,
        "Create image_embeddings",
        "CREATE TABLE image_embeddings (
            id         BIGSERIAL PRIMARY KEY,
            image_url  VARCHAR(200) NOT NULL,
            embedding  vector(512),
            metadata   JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );",
    )
    .with_reverse("DROP TABLE image_embeddings;")
    .requires(CapabilityName::vector())
    .expects(Postcondition::table("image_embeddings"))
}

fn items() -> MigrationStep {
    MigrationStep::new(
        10,
        "Create items",
        "CREATE TABLE items (
            id        BIGSERIAL PRIMARY KEY,
            embedding vector(768) NOT NULL
        );",
    )
    .with_reverse("DROP TABLE items;")
    .requires(CapabilityName::vector())
    .expects(Postcondition::table("items"))
}

#[cfg(test)]
mod tests {
    use pgforge_core::Orchestrator;
    use pgforge_core::capability::RequirementSet;
    use pgforge_core::executor::StepState;
    use pgforge_core::mock::MemoryDatabase;
    use pgforge_core::plan::StepId;
    use semver::Version;

    use super::*;

    #[test]
    fn default_plan_is_valid() {
        let plan = MigrationPlan::new(default_steps()).unwrap();
        assert_eq!(plan.len(), 10);
        assert_eq!(default_plan().unwrap(), plan);

        for step in &plan {
            assert!(step.is_reversible(), "step {} has no reverse", step.id);
            assert!(!step.postconditions.is_empty(), "step {} proves nothing", step.id);
        }
    }

    #[test]
    fn hypertables_follow_their_tables() {
        let plan = default_plan().unwrap();
        let step = plan.get(StepId::new(3)).unwrap();
        assert!(step.requires.contains(&CapabilityName::time_series()));
        assert!(step.after.contains(&StepId::new(2)));
        assert!(step.reverse.as_deref().unwrap().contains("CREATE INDEX sensor_readings_sensor_id_time_idx"));

        let step = plan.get(StepId::new(5)).unwrap();
        assert!(step.after.contains(&StepId::new(4)));
        assert!(step.forward.contains("'metric_data', 'timestamp'"));
    }

    #[tokio::test]
    async fn vector_only_deployment() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 4));
        let orchestrator = Orchestrator::new(
            RequirementSet::new().with("vector", Version::new(0, 5, 0)),
            default_plan().unwrap(),
        );

        let report = orchestrator.run(&mut db.connect()).await;

        assert!(report.is_success());
        let applied: Vec<u32> = report.applied_steps().into_iter().map(StepId::get).collect();
        assert_eq!(applied, vec![2, 4, 6, 7, 8, 9, 10]);
        for id in [1, 3, 5] {
            assert!(matches!(report.steps[id - 1].state, StepState::Blocked(_)));
        }
    }
}
