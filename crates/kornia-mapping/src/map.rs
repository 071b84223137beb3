use crate::database::Database;
use crate::descriptor::DescriptorMap;
use crate::error::MappingError;
use crate::types::LandmarkId;

/// A landmark map: the geometric database together with the landmark descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Map {
    /// Poses, landmarks and observations.
    pub database: Database,
    /// Descriptor sets keyed by landmark id.
    pub descriptors: DescriptorMap,
}

impl Map {
    /// Creates a map from its parts.
    pub fn new(database: Database, descriptors: DescriptorMap) -> Self {
        Self {
            database,
            descriptors,
        }
    }

    /// Removes a landmark from the database and its descriptors.
    pub fn remove_landmark(&mut self, id: LandmarkId) -> Result<(), MappingError> {
        self.database.remove_landmark(id)?;
        self.descriptors.remove(id);
        Ok(())
    }

    /// Merges `removed` into `survivor`: observations and descriptors move over.
    pub fn merge_landmarks(
        &mut self,
        survivor: LandmarkId,
        removed: LandmarkId,
    ) -> Result<(), MappingError> {
        self.database.merge_landmarks(survivor, removed)?;
        self.descriptors.merge_into(survivor, removed);
        Ok(())
    }
}
