pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use message::{
    AddManyPayload, AddNewKeyPayload, AddPayload, AddSectionPayload, AuthPayload, Command,
    CreateDbPayload, DeleteByIdPayload, DeleteByQueryPayload, GetAllBySectionPayload,
    GetByIdPayload, GetByQueryPayload, PurgePayload, Request, Response, SetIdGeneratorPayload,
    UpdateByIdPayload, UpdateByQueryPayload, UseDbPayload, UseSectionPayload, NO_ERROR,
};
