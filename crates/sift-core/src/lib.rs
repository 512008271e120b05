pub mod incident_contracts;
