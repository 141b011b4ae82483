use std::sync::Arc;

use crate::{
    model::{DataKind, Registers},
    prelude::*,
    single_flight::SingleFlight,
};

/// Lazily discovered register lists of both namespaces.
#[derive(Default)]
pub struct RegisterCache {
    instantaneous: SingleFlight<Arc<Registers>>,
    historical: SingleFlight<Arc<Registers>>,
}

impl RegisterCache {
    const fn cell(&self, kind: DataKind) -> &SingleFlight<Arc<Registers>> {
        match kind {
            DataKind::Instantaneous => &self.instantaneous,
            DataKind::Historical => &self.historical,
        }
    }

    /// Cached registers, discovering them on the first call.
    pub async fn get<F, Fut>(&self, kind: DataKind, discover: F) -> Result<Arc<Registers>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Registers>>> + Send + 'static,
    {
        self.cell(kind).get_or_fetch(|_| true, discover).await
    }

    /// Make sure that every name is known, re-discovering the registers once on a miss.
    ///
    /// Returns the register list that has been checked against.
    pub async fn ensure_known<'a, F, Fut>(
        &self,
        kind: DataKind,
        names: impl IntoIterator<Item = &'a str> + Clone,
        discover: F,
    ) -> Result<Arc<Registers>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<Registers>>> + Send + 'static,
    {
        let registers = self.get(kind, &discover).await?;
        let Some(missing) = first_unknown(&registers, names.clone()) else {
            return Ok(registers);
        };
        debug!(%kind, missing, "unknown register, refreshing the cache");
        self.refresh_if_current(kind, &registers).await;
        let registers = self.get(kind, &discover).await?;
        match first_unknown(&registers, names) {
            Some(missing) => Err(Error::UnknownRegister(missing.to_owned())),
            None => Ok(registers),
        }
    }

    /// Drop the list unless somebody has already replaced it.
    pub async fn refresh_if_current(&self, kind: DataKind, seen: &Arc<Registers>) {
        self.cell(kind).invalidate_if(|current| Arc::ptr_eq(current, seen)).await;
    }

    /// Drop one or both lists.
    pub async fn reset(&self, kind: Option<DataKind>) {
        match kind {
            Some(kind) => self.cell(kind).reset().await,
            None => {
                self.instantaneous.reset().await;
                self.historical.reset().await;
            }
        }
    }
}

fn first_unknown<'a>(
    registers: &Registers,
    names: impl IntoIterator<Item = &'a str>,
) -> Option<&'a str> {
    names.into_iter().find(|name| !registers.contains_key(*name))
}
