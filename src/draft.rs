//! Promotion Draft: the operator's in-progress product selection and discount.

use crate::models::Product;
use crate::workflow::WorkflowError;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "products", rename_all = "snake_case")]
pub enum DraftTarget {
    Single(Product),
    /// Snapshot of the page that was on screen when the dialog opened.
    AllDisplayed(Vec<Product>),
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionDraft {
    target: DraftTarget,
    discount: String,
}

impl PromotionDraft {
    /// A single product must carry an id and a name. The "all displayed"
    /// variant is checked per item at generation time instead.
    pub fn open(target: DraftTarget) -> Result<Self, WorkflowError> {
        match &target {
            DraftTarget::Single(product) if !product.is_complete() => {
                return Err(WorkflowError::IncompleteProduct);
            }
            DraftTarget::AllDisplayed(products) if products.is_empty() => {
                return Err(WorkflowError::EmptySelection);
            }
            _ => {}
        }
        Ok(Self {
            target,
            discount: String::new(),
        })
    }

    pub fn target(&self) -> &DraftTarget {
        &self.target
    }

    pub fn products(&self) -> &[Product] {
        match &self.target {
            DraftTarget::Single(product) => std::slice::from_ref(product),
            DraftTarget::AllDisplayed(products) => products,
        }
    }

    pub fn discount(&self) -> &str {
        &self.discount
    }

    pub fn set_discount(&mut self, value: impl Into<String>) {
        self.discount = value.into();
    }

    pub fn build_prompt(&self, product: &Product) -> String {
        let discount = self.discount.trim().trim_end_matches('%').trim();
        format!(
            "Create a realistic and visually appealing promotional banner featuring a {brand} {name}. \
The banner should showcase the product prominently with modern and sophisticated design elements. \
Include a headline that says '{discount}% OFF' in bold and stylish typography, making it the focal point of the banner. \
The background should be elegant and complement the product, enhancing its features. \
Include subtle, tasteful decorations related to the {category} category that do not overwhelm the main image. \
Aim for a clean, professional look that would attract customers in a retail setting",
            brand = product.brand,
            name = product.name,
            discount = discount,
            category = product.category,
        )
    }
}
