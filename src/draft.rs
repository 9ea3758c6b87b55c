//! In-progress order lines before submission.
//!
//! A line is identified by (product, note): adding the same product with the
//! same note bumps the quantity, a different note starts a new line.

use serde::Serialize;
use thiserror::Error;

use crate::models::{MenuProduct, OptionGroup, OptionItem, PendingOrderLine, SelectionKind};

#[derive(Debug, Error, PartialEq)]
pub enum DraftError {
    #[error("{0} is not available")]
    InactiveProduct(String),

    #[error("{product} does not accept option {option_id}")]
    UnknownOption { product: String, option_id: i64 },

    #[error("Only one option may be chosen from {0}")]
    TooManyOptions(String),

    #[error("{0} does not accept a note")]
    NoteNotAllowed(String),

    #[error("Quantity must be at least 1")]
    ZeroQuantity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftLine {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub note: Option<String>,
}

impl DraftLine {
    pub fn subtotal(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

fn clean_note(note: Option<&str>) -> Option<String> {
    note.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

/// Resolve chosen options into the captured unit price and line note.
///
/// Option names are joined with ", "; free text follows after " - ".
pub fn apply_options(
    product: &MenuProduct,
    group: Option<&OptionGroup>,
    option_ids: &[i64],
    free_text: Option<&str>,
) -> Result<(f64, Option<String>), DraftError> {
    let free_text = clean_note(free_text);
    if free_text.is_some() && !product.allows_note {
        return Err(DraftError::NoteNotAllowed(product.name.clone()));
    }

    let group = group.filter(|g| product.option_group_id == Some(g.id));
    let mut chosen: Vec<&OptionItem> = Vec::new();
    for &option_id in option_ids {
        let option = group.and_then(|g| g.option(option_id)).ok_or_else(|| {
            DraftError::UnknownOption {
                product: product.name.clone(),
                option_id,
            }
        })?;
        if !chosen.iter().any(|c| c.id == option_id) {
            chosen.push(option);
        }
    }
    if let Some(g) = group {
        if g.selection == SelectionKind::Single && chosen.len() > 1 {
            return Err(DraftError::TooManyOptions(g.name.clone()));
        }
    }

    let unit_price = product.unit_price() + chosen.iter().map(|o| o.price_delta).sum::<f64>();
    let names = chosen
        .iter()
        .map(|o| o.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let note = match (names.is_empty(), free_text) {
        (true, text) => text,
        (false, None) => Some(names),
        (false, Some(text)) => Some(format!("{names} - {text}")),
    };
    Ok((unit_price, note))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderDraft {
    lines: Vec<DraftLine>,
}

impl OrderDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[DraftLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn position(&self, product_id: i64, note: &Option<String>) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.product_id == product_id && &l.note == note)
    }

    /// Add one unit of `product`, merging into an identical line if present.
    pub fn add_product(
        &mut self,
        product: &MenuProduct,
        group: Option<&OptionGroup>,
        option_ids: &[i64],
        free_text: Option<&str>,
    ) -> Result<(), DraftError> {
        self.add_quantity(product, group, option_ids, free_text, 1)
    }

    pub fn add_quantity(
        &mut self,
        product: &MenuProduct,
        group: Option<&OptionGroup>,
        option_ids: &[i64],
        free_text: Option<&str>,
        quantity: u32,
    ) -> Result<(), DraftError> {
        if !product.active {
            return Err(DraftError::InactiveProduct(product.name.clone()));
        }
        if quantity == 0 {
            return Err(DraftError::ZeroQuantity);
        }
        let (unit_price, note) = apply_options(product, group, option_ids, free_text)?;

        match self.position(product.id, &note) {
            Some(i) => self.lines[i].quantity += quantity,
            None => self.lines.push(DraftLine {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity,
                unit_price,
                note,
            }),
        }
        Ok(())
    }

    /// Set a line's quantity; zero removes it. Returns false if no such line.
    pub fn set_quantity(&mut self, product_id: i64, note: Option<&str>, quantity: u32) -> bool {
        if quantity == 0 {
            return self.remove_line(product_id, note);
        }
        let note = clean_note(note);
        match self.position(product_id, &note) {
            Some(i) => {
                self.lines[i].quantity = quantity;
                true
            }
            None => false,
        }
    }

    pub fn remove_line(&mut self, product_id: i64, note: Option<&str>) -> bool {
        let note = clean_note(note);
        match self.position(product_id, &note) {
            Some(i) => {
                self.lines.remove(i);
                true
            }
            None => false,
        }
    }

    /// Rewrite a line's note. If another line already carries the new note
    /// for the same product, the two are merged with summed quantities.
    pub fn edit_note(&mut self, product_id: i64, old_note: Option<&str>, new_note: Option<&str>) -> bool {
        let old_note = clean_note(old_note);
        let new_note = clean_note(new_note);
        let Some(from) = self.position(product_id, &old_note) else {
            return false;
        };
        if old_note == new_note {
            return true;
        }

        match self.position(product_id, &new_note) {
            Some(into) => {
                let moved = self.lines[from].quantity;
                self.lines[into].quantity += moved;
                self.lines.remove(from);
            }
            None => self.lines[from].note = new_note,
        }
        true
    }

    pub fn total(&self) -> f64 {
        self.lines.iter().map(DraftLine::subtotal).sum()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn to_pending_lines(&self) -> Vec<PendingOrderLine> {
        self.lines
            .iter()
            .map(|l| PendingOrderLine {
                product_id: l.product_id,
                product_name: l.product_name.clone(),
                quantity: l.quantity,
                unit_price: l.unit_price,
                note: l.note.clone(),
            })
            .collect()
    }
}
