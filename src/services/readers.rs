//! Reader management service

use std::sync::Arc;

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{CreateReader, Reader, ReaderId, UpdateReader},
    repository::RecordStore,
};

#[derive(Clone)]
pub struct ReaderService {
    store: Arc<dyn RecordStore>,
}

impl ReaderService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Register a reader. Email or phone is required.
    pub async fn create(&self, data: &CreateReader) -> AppResult<Reader> {
        data.validate()?;
        let reader = self.store.create_reader(data).await?;
        tracing::info!(
            "Reader {} registered: {}{}",
            reader.id,
            reader.full_name(),
            if reader.is_employee { " (staff)" } else { "" }
        );
        Ok(reader)
    }

    pub async fn get(&self, id: ReaderId) -> AppResult<Reader> {
        self.store.get_reader(id).await
    }

    /// Apply a partial update. Fails if the reader would be left with no
    /// way to be contacted.
    pub async fn update(&self, id: ReaderId, data: &UpdateReader) -> AppResult<Reader> {
        data.validate()?;
        let mut reader = self.store.get_reader(id).await?;
        if !data.apply(&mut reader) {
            return Err(AppError::Validation(
                "Either email or phone is required".to_string(),
            ));
        }
        let reader = self.store.update_reader(&reader).await?;
        tracing::info!("Reader {} updated", id);
        Ok(reader)
    }

    /// Grant or withdraw staff status
    pub async fn set_employee(&self, id: ReaderId, is_employee: bool) -> AppResult<Reader> {
        let update = UpdateReader {
            is_employee: Some(is_employee),
            ..Default::default()
        };
        self.update(id, &update).await
    }

    /// Remove a reader with no loans on record
    pub async fn delete(&self, id: ReaderId) -> AppResult<()> {
        self.store.delete_reader(id).await?;
        tracing::info!("Reader {} deleted", id);
        Ok(())
    }
}
