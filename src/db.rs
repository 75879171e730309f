use anyhow::Context;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::{ClientRecord, ModelVariant, ScratchRecord, SelectionState, TargetRecord};
use crate::scoring::ModelBundle;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    ensure_selection(pool).await?;
    Ok(())
}

/// Inserts the default operator selection if the singleton row is missing.
/// The row is updated in place afterwards, never deleted.
pub async fn ensure_selection(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bank_clients.selection (model_variant, threshold)
        VALUES ('regular', 0.5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn client_from_row(row: &PgRow) -> ClientRecord {
    ClientRecord {
        id: row.get("id"),
        age: row.get("age"),
        gender: row.get("gender"),
        education: row.get("education"),
        marital_status: row.get("marital_status"),
        child_total: row.get("child_total"),
        dependants: row.get("dependants"),
        socstatus_work_fl: row.get("socstatus_work_fl"),
        socstatus_pens_fl: row.get("socstatus_pens_fl"),
        fact_address_province: row.get("fact_address_province"),
        fl_presence_fl: row.get("fl_presence_fl"),
        own_auto: row.get("own_auto"),
        credit: row.get("credit"),
        term: row.get("term"),
        fst_payment: row.get("fst_payment"),
        gen_industry: row.get("gen_industry"),
        gen_title: row.get("gen_title"),
        job_dir: row.get("job_dir"),
        work_time: row.get("work_time"),
        family_income: row.get("family_income"),
        personal_income: row.get("personal_income"),
        agreement_rk: row.get("agreement_rk"),
        target: row.get("target"),
    }
}

fn scratch_from_row(row: &PgRow) -> ScratchRecord {
    ScratchRecord {
        id: row.get("id"),
        age: row.get("age"),
        gender: row.get("gender"),
        education: row.get("education"),
        marital_status: row.get("marital_status"),
        child_total: row.get("child_total"),
        dependants: row.get("dependants"),
        socstatus_work_fl: row.get("socstatus_work_fl"),
        socstatus_pens_fl: row.get("socstatus_pens_fl"),
        fact_address_province: row.get("fact_address_province"),
        fl_presence_fl: row.get("fl_presence_fl"),
        own_auto: row.get("own_auto"),
        credit: row.get("credit"),
        term: row.get("term"),
        fst_payment: row.get("fst_payment"),
        gen_industry: row.get("gen_industry"),
        gen_title: row.get("gen_title"),
        job_dir: row.get("job_dir"),
        work_time: row.get("work_time"),
        family_income: row.get("family_income"),
        personal_income: row.get("personal_income"),
    }
}

fn selection_from_row(row: &PgRow) -> anyhow::Result<SelectionState> {
    let variant: String = row.get("model_variant");
    Ok(SelectionState {
        model_variant: variant
            .parse()
            .context("selection table holds an unrecognized model variant")?,
        threshold: row.get("threshold"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn fetch_clients(pool: &PgPool) -> anyhow::Result<Vec<ClientRecord>> {
    let rows = sqlx::query("SELECT * FROM bank_clients.clients ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(client_from_row).collect())
}

pub async fn fetch_targets(pool: &PgPool) -> anyhow::Result<Vec<TargetRecord>> {
    let rows = sqlx::query(
        "SELECT id, target, prediction_regular, prediction_tuned \
         FROM bank_clients.targets ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| TargetRecord {
            id: row.get("id"),
            target: row.get("target"),
            prediction_regular: row.get("prediction_regular"),
            prediction_tuned: row.get("prediction_tuned"),
        })
        .collect())
}

pub async fn fetch_scratch(pool: &PgPool) -> anyhow::Result<Option<ScratchRecord>> {
    let row = sqlx::query("SELECT * FROM bank_clients.scratch_client LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(scratch_from_row))
}

/// Replaces whatever the scratch buffer currently holds. Delete and insert
/// run in one transaction so the at-most-one-row invariant holds even when
/// two writers race.
pub async fn write_scratch(pool: &PgPool, record: &ScratchRecord) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM bank_clients.scratch_client")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO bank_clients.scratch_client
        (id, age, gender, education, marital_status, child_total, dependants,
         socstatus_work_fl, socstatus_pens_fl, fact_address_province,
         fl_presence_fl, own_auto, credit, term, fst_payment, gen_industry,
         gen_title, job_dir, work_time, family_income, personal_income)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21)
        "#,
    )
    .bind(record.id)
    .bind(record.age)
    .bind(record.gender)
    .bind(&record.education)
    .bind(&record.marital_status)
    .bind(record.child_total)
    .bind(record.dependants)
    .bind(record.socstatus_work_fl)
    .bind(record.socstatus_pens_fl)
    .bind(&record.fact_address_province)
    .bind(record.fl_presence_fl)
    .bind(record.own_auto)
    .bind(record.credit)
    .bind(record.term)
    .bind(record.fst_payment)
    .bind(&record.gen_industry)
    .bind(&record.gen_title)
    .bind(&record.job_dir)
    .bind(record.work_time)
    .bind(&record.family_income)
    .bind(record.personal_income)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// No-op when the buffer is already empty.
pub async fn delete_scratch(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM bank_clients.scratch_client")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn fetch_selection(pool: &PgPool) -> anyhow::Result<Option<SelectionState>> {
    let row = sqlx::query(
        "SELECT model_variant, threshold, updated_at FROM bank_clients.selection LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(selection_from_row).transpose()
}

/// Writes only when the stored variant differs, so an equal value leaves
/// `updated_at` untouched.
pub async fn update_selection_variant(
    pool: &PgPool,
    variant: ModelVariant,
) -> anyhow::Result<Option<SelectionState>> {
    sqlx::query(
        r#"
        UPDATE bank_clients.selection
        SET model_variant = $1, updated_at = now()
        WHERE model_variant IS DISTINCT FROM $1
        "#,
    )
    .bind(variant.as_str())
    .execute(pool)
    .await?;
    fetch_selection(pool).await
}

pub async fn update_selection_threshold(
    pool: &PgPool,
    threshold: f64,
) -> anyhow::Result<Option<SelectionState>> {
    sqlx::query(
        r#"
        UPDATE bank_clients.selection
        SET threshold = $1, updated_at = now()
        WHERE threshold IS DISTINCT FROM $1
        "#,
    )
    .bind(threshold)
    .execute(pool)
    .await?;
    fetch_selection(pool).await
}

async fn upsert_client(pool: &PgPool, record: &ClientRecord) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO bank_clients.clients
        (id, age, gender, education, marital_status, child_total, dependants,
         socstatus_work_fl, socstatus_pens_fl, fact_address_province,
         fl_presence_fl, own_auto, credit, term, fst_payment, gen_industry,
         gen_title, job_dir, work_time, family_income, personal_income,
         agreement_rk, target)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(record.id)
    .bind(record.age)
    .bind(record.gender)
    .bind(&record.education)
    .bind(&record.marital_status)
    .bind(record.child_total)
    .bind(record.dependants)
    .bind(record.socstatus_work_fl)
    .bind(record.socstatus_pens_fl)
    .bind(&record.fact_address_province)
    .bind(record.fl_presence_fl)
    .bind(record.own_auto)
    .bind(record.credit)
    .bind(record.term)
    .bind(record.fst_payment)
    .bind(&record.gen_industry)
    .bind(&record.gen_title)
    .bind(&record.job_dir)
    .bind(record.work_time)
    .bind(&record.family_income)
    .bind(record.personal_income)
    .bind(record.agreement_rk)
    .bind(record.target)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Stores the true label together with both variants' probabilities for the
/// record, computed once at load time with the frozen bundle.
async fn upsert_target(
    pool: &PgPool,
    bundle: &ModelBundle,
    record: &ClientRecord,
) -> anyhow::Result<()> {
    let features = record.features();
    let prediction_regular = bundle.probability(&features, ModelVariant::Regular)?;
    let prediction_tuned = bundle.probability(&features, ModelVariant::Tuned)?;
    sqlx::query(
        r#"
        INSERT INTO bank_clients.targets (id, target, prediction_regular, prediction_tuned)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET target = EXCLUDED.target,
            prediction_regular = EXCLUDED.prediction_regular,
            prediction_tuned = EXCLUDED.prediction_tuned
        "#,
    )
    .bind(record.id)
    .bind(record.target)
    .bind(prediction_regular)
    .bind(prediction_tuned)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bulk-loads the reference dataset from CSV, precomputing both variants'
/// probabilities per row. Returns the number of newly inserted clients.
pub async fn import_csv(
    pool: &PgPool,
    bundle: &ModelBundle,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<ClientRecord>() {
        let record = result.context("malformed client row in CSV")?;
        if upsert_client(pool, &record).await? {
            inserted += 1;
        }
        upsert_target(pool, bundle, &record).await?;
    }

    Ok(inserted)
}

pub async fn seed(pool: &PgPool, bundle: &ModelBundle) -> anyhow::Result<()> {
    let clients = sample_clients();
    for record in &clients {
        upsert_client(pool, record).await?;
        upsert_target(pool, bundle, record).await?;
    }
    ensure_selection(pool).await?;
    Ok(())
}

fn sample_clients() -> Vec<ClientRecord> {
    vec![
        ClientRecord {
            id: 59910150,
            age: 32,
            gender: 1,
            education: "Secondary special".to_string(),
            marital_status: "Married".to_string(),
            child_total: 2,
            dependants: 1,
            socstatus_work_fl: 1,
            socstatus_pens_fl: 0,
            fact_address_province: "Kemerovo region".to_string(),
            fl_presence_fl: 0,
            own_auto: 0,
            credit: 12_800.0,
            term: 6,
            fst_payment: 2_500.0,
            gen_industry: "Trade".to_string(),
            gen_title: "Worker".to_string(),
            job_dir: "Operations unit".to_string(),
            work_time: 36,
            family_income: "10000 to 20000".to_string(),
            personal_income: 13_500.0,
            agreement_rk: 62_246_336,
            target: 1,
        },
        ClientRecord {
            id: 59910230,
            age: 47,
            gender: 0,
            education: "Higher".to_string(),
            marital_status: "Divorced".to_string(),
            child_total: 1,
            dependants: 0,
            socstatus_work_fl: 1,
            socstatus_pens_fl: 0,
            fact_address_province: "Krasnodar region".to_string(),
            fl_presence_fl: 1,
            own_auto: 0,
            credit: 21_200.0,
            term: 12,
            fst_payment: 5_000.0,
            gen_industry: "Public sector".to_string(),
            gen_title: "Specialist".to_string(),
            job_dir: "Administration".to_string(),
            work_time: 120,
            family_income: "20000 to 50000".to_string(),
            personal_income: 24_000.0,
            agreement_rk: 62_246_500,
            target: 0,
        },
        ClientRecord {
            id: 59910525,
            age: 28,
            gender: 1,
            education: "Secondary".to_string(),
            marital_status: "Single".to_string(),
            child_total: 0,
            dependants: 0,
            socstatus_work_fl: 1,
            socstatus_pens_fl: 0,
            fact_address_province: "Altai region".to_string(),
            fl_presence_fl: 0,
            own_auto: 1,
            credit: 9_500.0,
            term: 4,
            fst_payment: 1_500.0,
            gen_industry: "Healthcare".to_string(),
            gen_title: "Worker".to_string(),
            job_dir: "Core staff".to_string(),
            work_time: 18,
            family_income: "up to 10000".to_string(),
            personal_income: 9_800.0,
            agreement_rk: 62_247_011,
            target: 0,
        },
        ClientRecord {
            id: 59910803,
            age: 58,
            gender: 0,
            education: "Secondary".to_string(),
            marital_status: "Widowed".to_string(),
            child_total: 3,
            dependants: 0,
            socstatus_work_fl: 0,
            socstatus_pens_fl: 1,
            fact_address_province: "Chita region".to_string(),
            fl_presence_fl: 1,
            own_auto: 0,
            credit: 15_400.0,
            term: 10,
            fst_payment: 3_000.0,
            gen_industry: "Other".to_string(),
            gen_title: "Other".to_string(),
            job_dir: "Other".to_string(),
            work_time: 0,
            family_income: "up to 10000".to_string(),
            personal_income: 8_200.0,
            agreement_rk: 62_247_388,
            target: 1,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scratch(id: i64) -> ScratchRecord {
        ScratchRecord {
            id,
            age: 31,
            gender: 1,
            education: "Secondary".to_string(),
            marital_status: "Married".to_string(),
            child_total: 1,
            dependants: 0,
            socstatus_work_fl: 1,
            socstatus_pens_fl: 0,
            fact_address_province: "Kemerovo region".to_string(),
            fl_presence_fl: 0,
            own_auto: 0,
            credit: 10_500.0,
            term: 6,
            fst_payment: 2_000.0,
            gen_industry: "Trade".to_string(),
            gen_title: "Worker".to_string(),
            job_dir: "Core staff".to_string(),
            work_time: 24,
            family_income: "10000 to 20000".to_string(),
            personal_income: 12_300.0,
        }
    }

    #[sqlx::test]
    async fn same_value_selection_update_leaves_timestamp_untouched(pool: PgPool) {
        ensure_selection(&pool).await.unwrap();
        let before = fetch_selection(&pool).await.unwrap().unwrap();
        assert_eq!(before.model_variant, ModelVariant::Regular);
        assert_eq!(before.threshold, 0.5);

        let after = update_selection_threshold(&pool, before.threshold)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.updated_at, before.updated_at);

        let after = update_selection_variant(&pool, before.model_variant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[sqlx::test]
    async fn changed_selection_values_are_written(pool: PgPool) {
        ensure_selection(&pool).await.unwrap();
        let before = fetch_selection(&pool).await.unwrap().unwrap();

        let after = update_selection_threshold(&pool, 0.7).await.unwrap().unwrap();
        assert_eq!(after.threshold, 0.7);
        assert!(after.updated_at >= before.updated_at);

        let after = update_selection_variant(&pool, ModelVariant::Tuned)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.model_variant, ModelVariant::Tuned);
    }

    #[sqlx::test]
    async fn selection_stays_a_singleton(pool: PgPool) {
        ensure_selection(&pool).await.unwrap();
        // re-running the bootstrap does not add a second row
        ensure_selection(&pool).await.unwrap();
        let selection = fetch_selection(&pool).await.unwrap().unwrap();
        assert_eq!(selection.model_variant, ModelVariant::Regular);

        // the schema itself rejects any row outside the singleton key
        let result = sqlx::query(
            "INSERT INTO bank_clients.selection (id, model_variant, threshold) \
             VALUES (FALSE, 'tuned', 0.1)",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }

    #[sqlx::test]
    async fn scratch_round_trips_unchanged(pool: PgPool) {
        assert!(fetch_scratch(&pool).await.unwrap().is_none());

        let record = sample_scratch(59_912_001);
        write_scratch(&pool, &record).await.unwrap();
        let stored = fetch_scratch(&pool).await.unwrap().unwrap();
        assert_eq!(stored, record);

        // a second write replaces the buffer instead of growing it
        let replacement = sample_scratch(59_912_002);
        write_scratch(&pool, &replacement).await.unwrap();
        let stored = fetch_scratch(&pool).await.unwrap().unwrap();
        assert_eq!(stored, replacement);
    }

    #[sqlx::test]
    async fn deleting_an_absent_scratch_row_succeeds(pool: PgPool) {
        delete_scratch(&pool).await.unwrap();

        write_scratch(&pool, &sample_scratch(59_912_003)).await.unwrap();
        delete_scratch(&pool).await.unwrap();
        assert!(fetch_scratch(&pool).await.unwrap().is_none());

        // and again, now that the buffer is empty
        delete_scratch(&pool).await.unwrap();
    }
}
