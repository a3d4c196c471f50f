//! Identity resolution over the member and admin account collections.

use xchange_db::models::IdentityRow;
use xchange_db::{Database, StoreResult};
use xchange_types::models::{Identity, Role};

/// Members are consulted first, then admins. `key` may be an id or an email.
pub fn resolve(db: &Database, key: &str) -> StoreResult<Option<Identity>> {
    if let Some(row) = db.find_member(key)? {
        return Ok(Some(into_identity(row)));
    }
    Ok(db.find_admin(key)?.map(into_identity))
}

/// Look up an identity whose role is already known (e.g. a stored participant).
pub fn resolve_with_role(db: &Database, id: &str, role: Role) -> StoreResult<Option<Identity>> {
    let row = match role {
        Role::Member => db.find_member(id)?,
        Role::Admin => db.find_admin(id)?,
    };
    Ok(row.map(into_identity))
}

fn into_identity(row: IdentityRow) -> Identity {
    Identity {
        id: row.id,
        display_name: row.display_name,
        email: row.email,
        role: row.role,
    }
}
