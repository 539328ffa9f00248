tonic::include_proto!("api");
