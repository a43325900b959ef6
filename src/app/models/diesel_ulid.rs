use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::io::Write;
use ulid::Ulid;

/// Ulid wrapper that maps to a text column in Postgres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = Text)]
pub struct DieselUlid(pub Ulid);

impl DieselUlid {
    pub fn new() -> Self {
        DieselUlid(Ulid::new())
    }

    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(DieselUlid(Ulid::from_string(s)?))
    }

    pub fn inner(&self) -> Ulid {
        self.0
    }
}

impl Default for DieselUlid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Ulid> for DieselUlid {
    fn from(ulid: Ulid) -> Self {
        DieselUlid(ulid)
    }
}

impl From<DieselUlid> for String {
    fn from(id: DieselUlid) -> Self {
        id.to_string()
    }
}

impl std::fmt::Display for DieselUlid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DieselUlid {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DieselUlid::from_string(s)
    }
}

impl ToSql<Text, Pg> for DieselUlid {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.0.to_string().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for DieselUlid {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(DieselUlid(Ulid::from_string(&s)?))
    }
}
