use async_trait::async_trait;

use crate::{
    contractor::{Contractor, ContractorRepository},
    outbox::sqlx::Error,
};

/// Contractor table in the same Postgres database as the outbox.
#[derive(Clone)]
pub struct PgContractorRepository {
    pool: sqlx::PgPool,
}

impl PgContractorRepository {
    /// Creates the repository and ensures the `contractor` table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS contractor (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                name TEXT NOT NULL,
                name_full TEXT,
                inn TEXT,
                ogrn TEXT,
                country TEXT,
                industry INTEGER,
                org_form INTEGER,
                create_date TIMESTAMPTZ NOT NULL DEFAULT now(),
                modify_date TIMESTAMPTZ,
                create_user_id TEXT,
                modify_user_id TEXT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// The committed contractor with `id`.
    pub async fn find(&self, id: &str) -> Result<Option<Contractor>, Error> {
        Ok(
            sqlx::query_as::<_, Contractor>("SELECT * FROM contractor WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl ContractorRepository for PgContractorRepository {
    type Error = Error;
    type Transaction = sqlx::PgTransaction<'static>;

    /// `create_date` and `create_user_id` are kept from the first insert;
    /// `modify_date` is stamped on every update.
    #[tracing::instrument(skip_all, fields(id = %contractor.id))]
    async fn save(
        &self,
        contractor: &Contractor,
        tx: &mut Self::Transaction,
    ) -> Result<Contractor, Self::Error> {
        let saved = sqlx::query_as::<_, Contractor>(
            "INSERT INTO contractor (
                id, parent_id, name, name_full, inn, ogrn, country, industry, org_form,
                create_user_id, modify_user_id, is_active
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, $11), $11, $12)
             ON CONFLICT (id) DO UPDATE SET
                parent_id = EXCLUDED.parent_id,
                name = EXCLUDED.name,
                name_full = EXCLUDED.name_full,
                inn = EXCLUDED.inn,
                ogrn = EXCLUDED.ogrn,
                country = EXCLUDED.country,
                industry = EXCLUDED.industry,
                org_form = EXCLUDED.org_form,
                modify_user_id = EXCLUDED.modify_user_id,
                is_active = EXCLUDED.is_active,
                modify_date = now()
             RETURNING *",
        )
        .bind(&contractor.id)
        .bind(&contractor.parent_id)
        .bind(&contractor.name)
        .bind(&contractor.name_full)
        .bind(&contractor.inn)
        .bind(&contractor.ogrn)
        .bind(&contractor.country)
        .bind(contractor.industry)
        .bind(contractor.org_form)
        .bind(&contractor.create_user_id)
        .bind(&contractor.modify_user_id)
        .bind(contractor.is_active)
        .fetch_one(&mut **tx)
        .await?;

        Ok(saved)
    }
}
