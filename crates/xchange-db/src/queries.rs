//! Read-mostly lookups into the account and catalog tables. Those tables are
//! owned by the account-management and catalog collaborators; the insert
//! helpers exist for seeding and tests.

use rusqlite::Connection;

use xchange_types::models::Role;

use crate::models::{IdentityRow, ProductRow};
use crate::{Database, OptionalExt, StoreError, StoreResult};

impl Database {
    // -- Members / Admins --

    /// Identity ids are unique across members and admins; conversations key
    /// participants on the id alone.
    pub fn insert_member(&self, id: &str, display_name: &str, email: &str) -> StoreResult<()> {
        self.with_tx(|conn| insert_identity(conn, "members", "admins", id, display_name, email))
    }

    pub fn insert_admin(&self, id: &str, display_name: &str, email: &str) -> StoreResult<()> {
        self.with_tx(|conn| insert_identity(conn, "admins", "members", id, display_name, email))
    }

    /// Look up a member by id or email.
    pub fn find_member(&self, key: &str) -> StoreResult<Option<IdentityRow>> {
        self.with_conn(|conn| query_identity(conn, "members", Role::Member, key))
    }

    /// Look up an admin by id or email.
    pub fn find_admin(&self, key: &str) -> StoreResult<Option<IdentityRow>> {
        self.with_conn(|conn| query_identity(conn, "admins", Role::Admin, key))
    }

    // -- Products --

    pub fn insert_product(&self, product: &ProductRow) -> StoreResult<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO products (id, name, price, image_url, seller_id) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    product.id,
                    product.name,
                    product.price,
                    product.image_url,
                    product.seller_id
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_product(&self, id: &str) -> StoreResult<Option<ProductRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, price, image_url, seller_id FROM products WHERE id = ?1",
                [id],
                |row| {
                    Ok(ProductRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        price: row.get(2)?,
                        image_url: row.get(3)?,
                        seller_id: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }
}

// `table` and `other` are literals chosen by the callers above
fn insert_identity(
    conn: &Connection,
    table: &str,
    other: &str,
    id: &str,
    display_name: &str,
    email: &str,
) -> StoreResult<()> {
    let taken: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", other),
        [id],
        |row| row.get(0),
    )?;
    if taken {
        return Err(StoreError::Conflict);
    }
    conn.execute(
        &format!("INSERT INTO {} (id, display_name, email) VALUES (?1, ?2, ?3)", table),
        (id, display_name, email.to_lowercase()),
    )?;
    Ok(())
}

fn query_identity(
    conn: &Connection,
    table: &str,
    role: Role,
    key: &str,
) -> StoreResult<Option<IdentityRow>> {
    // `table` is one of two literals chosen by the caller above
    let sql = format!(
        "SELECT id, display_name, email FROM {} WHERE id = ?1 OR email = ?1",
        table
    );
    conn.query_row(&sql, [key], |row| {
        Ok(IdentityRow {
            id: row.get(0)?,
            display_name: row.get(1)?,
            email: row.get(2)?,
            role,
        })
    })
    .optional()
}
