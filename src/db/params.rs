//! Parameter binding for PostgreSQL statements.

use crate::models::QueryParam;
use sqlx::Postgres;
use sqlx::postgres::PgArguments;

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Build a bound query from SQL and parameters.
pub(crate) fn bound_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_postgres_param(query, param))
}
