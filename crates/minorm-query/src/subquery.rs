//! Derived tables: a select or compound select used in FROM or JOIN under an
//! alias.

use crate::expr::Expr;
use crate::select::Select;
use crate::set_ops::CompoundSelect;
use minorm_core::{Bind, quote_ident};

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Select(Select),
    Compound(CompoundSelect),
}

/// A statement rendered as `(<sql>) AS "<alias>"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    source: Box<Source>,
    alias: String,
}

impl Subquery {
    pub(crate) fn new(source: impl Into<SubquerySource>, alias: impl Into<String>) -> Self {
        Self {
            source: Box::new(source.into().0),
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// A column of the derived table.
    pub fn c(&self, column: impl Into<String>) -> Expr {
        Expr::qualified(self.alias.clone(), column)
    }

    pub fn build(&self, binds: &mut Vec<Bind>) -> String {
        let (sql, inner) = match self.source.as_ref() {
            Source::Select(select) => select.build(),
            Source::Compound(compound) => compound.build(),
        };
        binds.extend(inner);
        format!("({}) AS {}", sql, quote_ident(&self.alias))
    }
}

/// Statement kinds a [`Subquery`] can wrap.
pub struct SubquerySource(Source);

impl From<Select> for SubquerySource {
    fn from(select: Select) -> Self {
        SubquerySource(Source::Select(select))
    }
}

impl From<CompoundSelect> for SubquerySource {
    fn from(compound: CompoundSelect) -> Self {
        SubquerySource(Source::Compound(compound))
    }
}
