pub mod error_dto;
pub mod health_dto;
pub mod stats_dto;
