use crate::models::Product;
use serde::Serialize;

/// One page of the filtered catalog as the operator sees it.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogPage {
    pub products: Vec<Product>,
    pub page: usize,
    pub page_count: usize,
    pub total: usize,
}

/// Case-insensitive substring match on the product name. An empty term
/// returns the whole catalog.
pub fn filter(products: &[Product], term: &str) -> Vec<Product> {
    if term.is_empty() {
        return products.to_vec();
    }
    let needle = term.to_lowercase();
    products
        .iter()
        .filter(|p| p.name.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

pub fn page_count(total: usize, page_size: usize) -> usize {
    total.div_ceil(page_size.max(1))
}

/// Slice for `page` (zero based); out-of-range pages are empty.
pub fn paginate<T>(items: &[T], page: usize, page_size: usize) -> &[T] {
    let size = page_size.max(1);
    let start = page.saturating_mul(size).min(items.len());
    let end = start.saturating_add(size).min(items.len());
    &items[start..end]
}

pub fn page_of(products: &[Product], term: &str, page: usize, page_size: usize) -> CatalogPage {
    let filtered = filter(products, term);
    CatalogPage {
        products: paginate(&filtered, page, page_size).to_vec(),
        page,
        page_count: page_count(filtered.len(), page_size),
        total: filtered.len(),
    }
}
